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

use std::io;

use thiserror::Error;

/// Standard BSD-style exit codes the spec requires `tardisd` to surface.
pub mod exit {
    /// Success.
    pub const OK: i32 = 0;
    /// Bad arguments (usage error).
    pub const USAGE: i32 = 64;
    /// I/O failure or the on-disk state is not what was expected.
    pub const IOERR: i32 = 74;
    /// Temporary or resource failure, e.g. space exhaustion.
    pub const TEMPFAIL: i32 = 75;
    /// Permission failure (config mode, not running as root).
    pub const NOPERM: i32 = 77;
    /// Generic failure not covered by the above.
    pub const FAILURE: i32 = 1;
}

/// A `TardisError` indicates an error condition raised by one of the core
/// subsystems (ConfigStore, FsProbe, ImageManager, SnapshotEngine, DumpStore).
///
/// Every variant maps to one of the error kinds in spec.md §7; see
/// [`TardisError::exit_code`] for the mapping to process exit codes.
#[derive(Debug, Error)]
pub enum TardisError {
    /// A required argument was missing, malformed, or non-numeric where a
    /// number was required.
    #[error("usage error: {0}")]
    Usage(String),

    /// The config file's permission bits allow more than owner read-write,
    /// or an operation requiring the superuser was not run as one.
    #[error("permission error: {0}")]
    Permission(String),

    /// The config file failed to parse, or referenced a tree/dump id that
    /// doesn't exist.
    #[error("config error: {0}")]
    Config(String),

    /// A syntax error while parsing an INI-dialect config or metadata file.
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Failed to probe free space / inode counts for a path.
    #[error("failed to probe filesystem at {path}: {source}")]
    FsProbe { path: String, source: io::Error },

    /// A loop device attach, detach, or `mount`/`umount` call failed.
    #[error("mount error: {0}")]
    Mount(String),

    /// `mkfs` exited non-zero or could not be spawned.
    #[error("format error: {0}")]
    Format(String),

    /// Reclaiming/evicting could not free enough space even after
    /// respecting the retention floor.
    #[error("space exhaustion: {0}")]
    SpaceExhaustion(String),

    /// The `.tardis_meta` file could not be read or written.
    #[error("metadata I/O error: {0}")]
    MetaIo(String),

    /// The snapshot ring is in a state rotation cannot safely proceed
    /// from, e.g. more than one `backup.*` directory but a highest
    /// suffix of `0`.
    #[error("snapshot ring corrupt: {0}")]
    RingCorrupt(String),

    /// An underlying I/O error with no more specific classification.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TardisError {
    /// Maps this error to the process exit code `tardisd` should use,
    /// per spec.md §4.7 and §7.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exit::USAGE,
            Self::Permission(_) => exit::NOPERM,
            Self::Config(_) | Self::Syntax { .. } => exit::IOERR,
            Self::FsProbe { .. } | Self::Mount(_) | Self::Format(_) => exit::IOERR,
            Self::SpaceExhaustion(_) => exit::TEMPFAIL,
            Self::MetaIo(_) => exit::IOERR,
            Self::RingCorrupt(_) => exit::IOERR,
            Self::Io(_) => exit::FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, TardisError>;
