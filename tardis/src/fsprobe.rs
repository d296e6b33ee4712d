// tardis is the shared library implementing the Tardis backup server core.
// Copyright (C) 2026  Tardis Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! FsProbe: total/used/free bytes and inode counts for a given path, via
//! `statvfs(2)`.

use crate::error::TardisError;

use std::path::Path;

/// The five quantities FsProbe reports for a path.
///
/// `free_inodes` is `-1` on filesystems that don't track an inode limit
/// (in which case `total_inodes` is also `0`) — this is the sentinel
/// spec.md §4.3 calls "no inode constraint".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: i64,
}

impl FsStats {
    /// Reports whether this filesystem enforces an inode limit.
    pub fn has_inode_limit(&self) -> bool {
        self.free_inodes >= 0
    }
}

/// Probes the filesystem backing `path` for space and inode usage.
pub fn probe(path: impl AsRef<Path>) -> Result<FsStats, TardisError> {
    let path = path.as_ref();

    let stat = nix::sys::statvfs::statvfs(path).map_err(|errno| TardisError::FsProbe {
        path: path.display().to_string(),
        source: std::io::Error::from(errno),
    })?;

    let frsize = stat.fragment_size();
    let blocks = stat.blocks();
    let free_blocks = stat.blocks_free();
    let total_bytes = blocks * frsize;
    let free_bytes = free_blocks * frsize;
    let used_bytes = total_bytes.saturating_sub(free_bytes);

    let total_files = stat.files();
    let (total_inodes, free_inodes) = if total_files == 0 {
        (0, -1)
    } else {
        (total_files, stat.files_free() as i64)
    };

    Ok(FsStats {
        total_bytes,
        used_bytes,
        free_bytes,
        total_inodes,
        free_inodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_a_real_mountpoint() {
        let stats = probe("/").unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.free_bytes <= stats.total_bytes);
    }

    #[test]
    fn has_inode_limit_matches_sentinel() {
        let unconstrained = FsStats {
            total_bytes: 0,
            used_bytes: 0,
            free_bytes: 0,
            total_inodes: 0,
            free_inodes: -1,
        };
        assert!(!unconstrained.has_inode_limit());

        let constrained = FsStats {
            free_inodes: 1000,
            ..unconstrained
        };
        assert!(constrained.has_inode_limit());
    }
}
