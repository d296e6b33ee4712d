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

//! DumpStore: the size-capped database dump directory, evicted
//! oldest-first past the `forcedbs` retention floor.

use crate::config::TardisConfig;
use crate::diag;
use crate::error::TardisError;
use crate::fsprobe;
use crate::size;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;

/// Result of a successful [`admit_dump`] call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DumpAdmitReport {
    pub used_before: u64,
    pub freed_bytes: u64,
    pub evicted: Vec<String>,
}

#[derive(Clone, Debug)]
struct DumpFile {
    path: PathBuf,
    mtime: SystemTime,
    size: u64,
}

/// Reserves room for an incoming dump of `req_bytes`, evicting the
/// oldest dump files past the `forcedbs` retention floor if the
/// directory is over `server.dbsize`. Creates `dir` if it doesn't yet
/// exist. Does not check physical free space on the host filesystem;
/// call [`check_physical_headroom`] separately once this succeeds.
pub fn admit_dump(
    dir: impl AsRef<Path>,
    req_bytes: u64,
    config: &TardisConfig,
) -> Result<DumpAdmitReport, TardisError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }

    let used = measure_usage(dir)?;
    let limit = config.dbsize()?;

    if used + req_bytes <= limit {
        return Ok(DumpAdmitReport {
            used_before: used,
            freed_bytes: 0,
            evicted: Vec::new(),
        });
    }

    let need = used + req_bytes - limit;
    let forcedbs = config.forcedbs()?;

    let mut oldest_first = list_dump_files(dir)?;
    let candidates: Vec<DumpFile> = if oldest_first.len() > forcedbs {
        oldest_first.drain(..oldest_first.len() - forcedbs).collect()
    } else {
        Vec::new()
    };

    let mut selected = Vec::new();
    let mut planned = 0u64;
    for entry in &candidates {
        if planned >= need {
            break;
        }
        planned += entry.size;
        selected.push(entry.clone());
    }

    if planned < need {
        return Err(TardisError::SpaceExhaustion(format!(
            "cannot free enough space in {}: short by {}",
            dir.display(),
            size::format_size(need - planned)
        )));
    }

    let whitelist = dump_filename_pattern();
    let mut freed = 0u64;
    let mut evicted = Vec::new();

    for entry in &selected {
        let name = entry
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if !whitelist.is_match(name) {
            diag::warn(format!("refusing to unlink non-conforming dump filename {name}"));
            continue;
        }

        match fs::remove_file(&entry.path) {
            Ok(()) => {
                freed += entry.size;
                evicted.push(name.to_string());
            }
            Err(e) => diag::warn(format!("failed to unlink {}: {e}", entry.path.display())),
        }
    }

    if freed < need {
        return Err(TardisError::SpaceExhaustion(format!(
            "unable to release enough space in {}: short by {}",
            dir.display(),
            size::format_size(need - freed)
        )));
    }

    Ok(DumpAdmitReport {
        used_before: used,
        freed_bytes: freed,
        evicted,
    })
}

/// Confirms that the host filesystem backing `dir` has at least
/// `req_bytes` physically free. The logical `dbsize` quota may be
/// smaller than physical free space but must never be larger; this is
/// the cross-check spec.md §4.6 step 5 calls for, run by the caller
/// after [`admit_dump`] succeeds.
pub fn check_physical_headroom(dir: impl AsRef<Path>, req_bytes: u64) -> Result<(), TardisError> {
    let stats = fsprobe::probe(dir)?;
    if stats.free_bytes < req_bytes {
        return Err(TardisError::SpaceExhaustion(format!(
            "physical free space ({}) is less than the requested {}",
            size::format_size(stats.free_bytes),
            size::format_size(req_bytes)
        )));
    }
    Ok(())
}

fn measure_usage(dir: &Path) -> Result<u64, TardisError> {
    let mut total = 0u64;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += measure_usage(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }

    Ok(total)
}

fn list_dump_files(dir: &Path) -> Result<Vec<DumpFile>, TardisError> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let metadata = entry.metadata()?;
        files.push(DumpFile {
            path: entry.path(),
            mtime: metadata.modified()?,
            size: metadata.len(),
        });
    }

    files.sort_by_key(|f| f.mtime);
    Ok(files)
}

fn dump_filename_pattern() -> Regex {
    Regex::new(r"^[A-Za-z0-9_.-]+-\d{8}-\d{4}\.sql\.bz2$").expect("valid regex literal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_dump(dir: &Path, name: &str, contents: &[u8]) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents).unwrap();
    }

    fn config(dbsize: &str, forcedbs: &str) -> TardisConfig {
        let text = format!(
            "\
[server]
base = \"/srv/tardis\"
dbdir = \"dumps\"
dbsize = \"{dbsize}\"
bytebuffer = \"0\"
inodebuffer = \"0\"
forcedbs = \"{forcedbs}\"
forcesnaps = \"7\"
fstype = \"xfs\"
fsopts = \"\"
mountargs = \"\"
user = \"thedoctor\"
group = \"thedoctor\"
"
        );
        let raw = crate::config::Config::parse(&text).unwrap();
        TardisConfig::from_raw(raw).unwrap()
    }

    #[test]
    fn admits_without_eviction_when_under_quota() {
        let dir = tempdir().unwrap();
        write_dump(dir.path(), "maindb-20260101-0200.sql.bz2", b"12345");

        let cfg = config("1G", "7");
        let report = admit_dump(dir.path(), 100, &cfg).unwrap();
        assert_eq!(report.freed_bytes, 0);
        assert!(report.evicted.is_empty());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dumps");

        let cfg = config("1G", "7");
        admit_dump(&target, 10, &cfg).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn evicts_oldest_past_retention_floor() {
        let dir = tempdir().unwrap();
        for i in 0..9 {
            write_dump(
                dir.path(),
                &format!("maindb-2026010{i}-0200.sql.bz2"),
                &vec![0u8; 1024],
            );
            sleep(Duration::from_millis(5));
        }

        // dbsize tiny relative to used, forcedbs=7 protects the 7 newest.
        let cfg = config("1024", "7");
        let report = admit_dump(dir.path(), 1024, &cfg).unwrap();

        assert!(!report.evicted.is_empty());
        assert!(report.evicted.iter().all(|n| n.starts_with("maindb-20260100")
            || n.starts_with("maindb-20260101")));

        let remaining: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.len() <= 9);
    }

    #[test]
    fn refuses_to_unlink_non_conforming_filenames() {
        let dir = tempdir().unwrap();
        write_dump(dir.path(), "not-a-dump.txt", &vec![0u8; 4096]);

        let cfg = config("1", "0");
        match admit_dump(dir.path(), 1, &cfg) {
            Err(TardisError::SpaceExhaustion(_)) => {}
            other => panic!("expected SpaceExhaustion (whitelist blocked eviction), got {other:?}"),
        }
    }

    #[test]
    fn physical_headroom_check_rejects_insufficient_free_space() {
        let dir = tempdir().unwrap();
        let huge = u64::MAX - 1;
        assert!(check_physical_headroom(dir.path(), huge).is_err());
        assert!(check_physical_headroom(dir.path(), 1).is_ok());
    }
}
