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

//! SnapshotEngine: the numbered `backup.0 .. backup.N` ring, its
//! free-space reclamation loop, rotation, and the hard-link duplication
//! that turns `backup.0` into `backup.1` before rsync mutates `backup.0`.

use crate::config::TardisConfig;
use crate::diag;
use crate::error::TardisError;
use crate::fsprobe::{self, FsStats};
use crate::meta::Meta;

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{mknod, utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;

/// Returns the numeric suffixes of every `backup.<digits>` directory
/// directly under `mountpoint`, ascending. Entries whose name matches
/// `backup.` but carries no parseable digits are skipped; they cannot
/// arise from this engine's own output and are treated as foreign.
pub fn ring_indices(mountpoint: impl AsRef<Path>) -> Result<Vec<u32>, TardisError> {
    let mut indices = Vec::new();

    for entry in fs::read_dir(mountpoint.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(rest) = name.to_string_lossy().strip_prefix("backup.") {
            if let Ok(idx) = rest.parse::<u32>() {
                indices.push(idx);
            }
        }
    }

    indices.sort_unstable();
    Ok(indices)
}

fn sufficient(req_bytes: u64, req_inodes: u64, stats: &FsStats) -> bool {
    req_bytes <= stats.free_bytes && (!stats.has_inode_limit() || req_inodes < stats.free_inodes as u64)
}

/// Reserves space for the next rsync, reclaiming oldest-first past the
/// `forcesnaps` retention floor if necessary. Returns the indices of any
/// snapshots that were deleted, in the order they were deleted. Never
/// rotates the ring; that is [`rotate`]'s job, run only after this
/// succeeds.
///
/// Metadata changes caused by deletions are persisted immediately, even
/// if this function ultimately returns an error — a later reclaim pass
/// must never see a `snapshots.backup.K` entry whose directory is gone.
pub fn admit(
    mountpoint: impl AsRef<Path>,
    req_bytes: u64,
    req_inodes: u64,
    meta: &mut Meta,
    meta_path: impl AsRef<Path>,
    config: &TardisConfig,
) -> Result<Vec<u32>, TardisError> {
    let mountpoint = mountpoint.as_ref();
    let meta_path = meta_path.as_ref();

    let mut stats = fsprobe::probe(mountpoint)?;
    let mut req_bytes = req_bytes + config.bytebuffer()?;
    let mut req_inodes = req_inodes + config.inodebuffer()?;

    if req_bytes >= stats.total_bytes || (stats.has_inode_limit() && req_inodes >= stats.total_inodes) {
        return Err(TardisError::SpaceExhaustion(
            "could never fit: request exceeds total filesystem capacity".to_string(),
        ));
    }

    if stats.has_inode_limit() {
        req_inodes += count_unique_inodes(mountpoint.join("backup.0"))?;
    }

    if sufficient(req_bytes, req_inodes, &stats) {
        return Ok(Vec::new());
    }

    let forcesnaps = config.forcesnaps()?;
    let ring = ring_indices(mountpoint)?;
    let oldest_first: Vec<u32> = ring.iter().rev().copied().collect();

    if oldest_first.len() <= forcesnaps {
        return Err(TardisError::SpaceExhaustion(
            "not enough snapshots present to reclaim from".to_string(),
        ));
    }

    let candidates = &oldest_first[..oldest_first.len() - forcesnaps];
    let mut reclaimed = Vec::new();

    for &idx in candidates {
        if (idx as usize) < forcesnaps {
            continue;
        }

        let dir = mountpoint.join(format!("backup.{idx}"));
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                meta.remove_snapshot(idx);
                meta.save(meta_path, true)?;
                reclaimed.push(idx);
            }
            Err(e) => {
                diag::warn(format!("failed to reclaim backup.{idx}: {e}"));
                continue;
            }
        }

        stats = fsprobe::probe(mountpoint)?;
        if sufficient(req_bytes, req_inodes, &stats) {
            break;
        }
    }

    if !sufficient(req_bytes, req_inodes, &stats) {
        return Err(TardisError::SpaceExhaustion(
            "unable to release enough space even after respecting the retention floor".to_string(),
        ));
    }

    Ok(reclaimed)
}

/// Rotates the ring after a successful [`admit`]: `backup.i` becomes
/// `backup.(i+1)` for every `i` from the highest suffix down to `1`,
/// then `backup.0` is hard-link-duplicated into a fresh `backup.1`.
/// `backup.0` itself is left in place for rsync to mutate.
///
/// Skipped entirely if fewer than two `backup.*` directories exist —
/// there is nothing to base `backup.1` on yet.
pub fn rotate(
    mountpoint: impl AsRef<Path>,
    meta: &mut Meta,
    meta_path: impl AsRef<Path>,
) -> Result<(), TardisError> {
    let mountpoint = mountpoint.as_ref();
    let meta_path = meta_path.as_ref();

    let ring = ring_indices(mountpoint)?;
    if ring.len() < 2 {
        return Ok(());
    }

    let highest = *ring.iter().max().expect("non-empty ring checked above");
    if highest == 0 {
        return Err(TardisError::RingCorrupt(format!(
            "{} backup directories present but highest suffix is 0",
            ring.len()
        )));
    }

    for i in (1..=highest).rev() {
        let src = mountpoint.join(format!("backup.{i}"));
        if !src.is_dir() {
            continue;
        }

        let dst = mountpoint.join(format!("backup.{}", i + 1));
        fs::rename(&src, &dst)?;
        if let Some(ts) = meta.snapshot_timestamp(i) {
            meta.set_snapshot_timestamp(i + 1, ts);
        }
    }

    let backup0 = mountpoint.join("backup.0");
    if backup0.is_dir() {
        let backup1 = mountpoint.join("backup.1");
        hardlink_duplicate(&backup0, &backup1)?;
        if let Some(ts) = meta.snapshot_timestamp(0) {
            meta.set_snapshot_timestamp(1, ts);
        }
    }

    meta.save(meta_path, true)?;
    Ok(())
}

/// Records the completion timestamp of the newest snapshot. Harmless
/// to call out of order (e.g. before [`admit`]) — it only ever touches
/// `snapshots.backup.0`.
pub fn stamp(meta: &mut Meta, meta_path: impl AsRef<Path>, timestamp: i64) -> Result<(), TardisError> {
    meta.set_snapshot_timestamp(0, timestamp);
    meta.save(meta_path, true)
}

/// Estimates the inode cost of duplicating `dir`'s unique-inode set, for
/// the inode-accounting step of [`admit`]. Returns `0` if `dir` doesn't
/// exist yet (first-ever backup, nothing to duplicate).
fn count_unique_inodes(dir: impl AsRef<Path>) -> Result<u64, TardisError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(0);
    }

    let mut seen = HashSet::new();
    walk_inodes(dir, &mut seen)?;
    Ok(seen.len() as u64)
}

fn walk_inodes(dir: &Path, seen: &mut HashSet<(u64, u64)>) -> Result<(), TardisError> {
    seen.insert(inode_key(dir)?);

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_inodes(&path, seen)?;
        } else {
            seen.insert(inode_key(&path)?);
        }
    }

    Ok(())
}

fn inode_key(path: &Path) -> Result<(u64, u64), TardisError> {
    let metadata = fs::symlink_metadata(path)?;
    Ok((metadata.dev(), metadata.ino()))
}

/// Recreates `src` at `dst`: directories are recreated, regular files
/// are `link()`ed (sharing inodes, never copying bytes), symlinks are
/// recreated pointing at the same target, and device/fifo/socket nodes
/// are recreated with `mknod`. Permissions are preserved throughout;
/// timestamps are preserved on directories and special files (hard
/// links inherit theirs for free since they share an inode).
fn hardlink_duplicate(src: &Path, dst: &Path) -> Result<(), TardisError> {
    let src_meta = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let child_src = entry.path();
        let child_dst = dst.join(entry.file_name());

        if file_type.is_dir() {
            hardlink_duplicate(&child_src, &child_dst)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&child_src)?;
            std::os::unix::fs::symlink(&target, &child_dst)?;
        } else if file_type.is_file() {
            fs::hard_link(&child_src, &child_dst)?;
        } else {
            clone_special_file(&child_src, &child_dst)?;
        }
    }

    apply_metadata(dst, &src_meta)
}

fn apply_metadata(path: &Path, src_meta: &fs::Metadata) -> Result<(), TardisError> {
    fs::set_permissions(path, src_meta.permissions())?;

    let atime = TimeSpec::new(src_meta.atime(), src_meta.atime_nsec());
    let mtime = TimeSpec::new(src_meta.mtime(), src_meta.mtime_nsec());
    utimensat(None, path, &atime, &mtime, UtimensatFlags::FollowSymlink)
        .map_err(|e| TardisError::Mount(format!("preserving timestamps on {}: {e}", path.display())))?;

    Ok(())
}

fn clone_special_file(src: &Path, dst: &Path) -> Result<(), TardisError> {
    let src_meta = fs::symlink_metadata(src)?;
    let file_type = src_meta.file_type();

    let kind = if file_type.is_char_device() {
        SFlag::S_IFCHR
    } else if file_type.is_block_device() {
        SFlag::S_IFBLK
    } else if file_type.is_fifo() {
        SFlag::S_IFIFO
    } else if file_type.is_socket() {
        SFlag::S_IFSOCK
    } else {
        return Err(TardisError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} has no recognised file type to duplicate", src.display()),
        )));
    };

    let mode = Mode::from_bits_truncate(src_meta.permissions().mode());
    mknod(dst, kind, mode, src_meta.rdev())
        .map_err(|e| TardisError::Mount(format!("mknod {}: {e}", dst.display())))?;

    apply_metadata(dst, &src_meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn ring_indices_lists_and_sorts_ascending() {
        let dir = tempdir().unwrap();
        for name in ["backup.2", "backup.0", "backup.10", "notbackup"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        assert_eq!(ring_indices(dir.path()).unwrap(), vec![0, 2, 10]);
    }

    #[test]
    fn hardlink_duplicate_shares_inodes_for_regular_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("backup.0");
        fs::create_dir(&src).unwrap();
        write_file(&src.join("unchanged.txt"), b"same bytes");
        fs::create_dir(src.join("subdir")).unwrap();
        write_file(&src.join("subdir/nested.txt"), b"nested bytes");

        let dst = dir.path().join("backup.1");
        hardlink_duplicate(&src, &dst).unwrap();

        let src_ino = fs::metadata(src.join("unchanged.txt")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("unchanged.txt")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);

        let nested_src_ino = fs::metadata(src.join("subdir/nested.txt")).unwrap().ino();
        let nested_dst_ino = fs::metadata(dst.join("subdir/nested.txt")).unwrap().ino();
        assert_eq!(nested_src_ino, nested_dst_ino);
    }

    #[test]
    fn admit_succeeds_without_deletion_when_space_is_ample() {
        let dir = tempdir().unwrap();
        let mut meta = Meta::new(1 << 30);
        let meta_path = dir.path().join(Meta::FILE_NAME);
        meta.save(&meta_path, true).unwrap();

        let config_text = "\
[server]
base = \"/srv/tardis\"
dbdir = \"dumps\"
dbsize = \"5G\"
bytebuffer = \"1\"
inodebuffer = \"1\"
forcedbs = \"7\"
forcesnaps = \"7\"
fstype = \"xfs\"
fsopts = \"\"
mountargs = \"\"
user = \"thedoctor\"
group = \"thedoctor\"
";
        let raw = crate::config::Config::parse(config_text).unwrap();
        let config = TardisConfig::from_raw(raw).unwrap();

        let reclaimed = admit(dir.path(), 1, 1, &mut meta, &meta_path, &config).unwrap();
        assert!(reclaimed.is_empty());
    }

    #[test]
    fn rotate_is_a_noop_with_fewer_than_two_snapshots() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("backup.0")).unwrap();

        let mut meta = Meta::new(1 << 20);
        let meta_path = dir.path().join(Meta::FILE_NAME);
        meta.save(&meta_path, true).unwrap();

        rotate(dir.path(), &mut meta, &meta_path).unwrap();
        assert!(dir.path().join("backup.0").is_dir());
        assert!(!dir.path().join("backup.1").exists());
    }

    #[test]
    fn rotate_shifts_ring_and_duplicates_backup_zero() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("backup.0")).unwrap();
        write_file(&dir.path().join("backup.0/data.txt"), b"current");
        fs::create_dir(dir.path().join("backup.1")).unwrap();

        let mut meta = Meta::new(1 << 20);
        meta.set_snapshot_timestamp(0, 1_700_000_100);
        meta.set_snapshot_timestamp(1, 1_700_000_000);
        let meta_path = dir.path().join(Meta::FILE_NAME);
        meta.save(&meta_path, true).unwrap();

        rotate(dir.path(), &mut meta, &meta_path).unwrap();

        assert!(dir.path().join("backup.0").is_dir());
        assert!(dir.path().join("backup.1/data.txt").is_file());
        assert!(dir.path().join("backup.2").is_dir());
        assert_eq!(meta.snapshot_timestamp(1), Some(1_700_000_100));
        assert_eq!(meta.snapshot_timestamp(2), Some(1_700_000_000));
    }

    #[test]
    fn rotate_rejects_broken_ring_with_highest_suffix_zero() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("backup.0")).unwrap();
        // Two directories present, but the naming is broken: both claim suffix 0.
        fs::create_dir(dir.path().join("backup.00")).unwrap();

        let mut meta = Meta::new(1 << 20);
        let meta_path = dir.path().join(Meta::FILE_NAME);
        meta.save(&meta_path, true).unwrap();

        match rotate(dir.path(), &mut meta, &meta_path) {
            Err(TardisError::RingCorrupt(_)) => {}
            other => panic!("expected RingCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn stamp_sets_backup_zero_timestamp() {
        let dir = tempdir().unwrap();
        let mut meta = Meta::new(1 << 20);
        let meta_path = dir.path().join(Meta::FILE_NAME);

        stamp(&mut meta, &meta_path, 1_700_000_000).unwrap();
        assert_eq!(meta.snapshot_timestamp(0), Some(1_700_000_000));

        let reloaded = Meta::load(&meta_path).unwrap();
        assert_eq!(reloaded.snapshot_timestamp(0), Some(1_700_000_000));
    }
}
