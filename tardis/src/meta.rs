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

//! `.tardis_meta`: the per-image metadata file. Same INI grammar as the
//! operator config (spec.md §4.2), with two sections: `image.size` (the
//! declared logical image size) and `snapshots.backup.K` (completion
//! timestamps per ring slot).

use crate::config::Config;
use crate::error::TardisError;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A `Meta` wraps the raw [`Config`] backing `.tardis_meta` with typed
/// accessors for the `image` and `snapshots` sections.
pub struct Meta {
    config: Config,
}

impl Meta {
    pub const FILE_NAME: &'static str = ".tardis_meta";

    /// Builds a fresh `Meta` recording `declared_size` and no snapshots.
    pub fn new(declared_size: u64) -> Self {
        let mut config = Config::new();
        config.set("image", "size", declared_size.to_string());
        Self { config }
    }

    /// Loads a `.tardis_meta` file. Unlike the operator config, metadata
    /// files carry no secrets, so no permission-mode check is applied.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TardisError> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| TardisError::MetaIo(format!("reading {}: {e}", path.as_ref().display())))?;
        let config = Config::parse(&text)?;
        Ok(Self { config })
    }

    /// Persists the metadata file, always writing unless `force` is
    /// false and nothing has changed since the last save.
    pub fn save(&mut self, path: impl AsRef<Path>, force: bool) -> Result<(), TardisError> {
        self.config.save(path, force).map_err(|e| match e {
            TardisError::Io(io) => {
                TardisError::MetaIo(format!("writing {}: {io}", path.as_ref().display()))
            }
            other => other,
        })
    }

    /// Returns the declared logical image size in bytes.
    pub fn image_size(&self) -> u64 {
        self.config
            .get("image", "size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Sets the declared logical image size.
    pub fn set_image_size(&mut self, size: u64) {
        self.config.set("image", "size", size.to_string());
    }

    /// Returns the Unix timestamp at which snapshot `k` was completed.
    pub fn snapshot_timestamp(&self, k: u32) -> Option<i64> {
        self.config
            .get("snapshots", &format!("backup.{k}"))
            .and_then(|s| s.parse().ok())
    }

    /// Records the completion timestamp for snapshot `k`.
    pub fn set_snapshot_timestamp(&mut self, k: u32, timestamp: i64) {
        self.config
            .set("snapshots", &format!("backup.{k}"), timestamp.to_string());
    }

    /// Removes the metadata entry for snapshot `k`, if present.
    pub fn remove_snapshot(&mut self, k: u32) {
        self.config.remove("snapshots", &format!("backup.{k}"));
    }

    /// Returns the set of snapshot indices recorded in metadata, i.e. the
    /// `K` in every `snapshots.backup.K` key.
    pub fn snapshot_indices(&self) -> HashSet<u32> {
        self.config
            .keys("snapshots")
            .into_iter()
            .filter_map(|key| key.strip_prefix("backup.")?.parse().ok())
            .collect()
    }
}
