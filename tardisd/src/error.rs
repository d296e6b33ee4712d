// tardisd is the operational CLI shell around the tardis library.
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

use thiserror::Error;

/// Errors raised by `tardisd`'s own preflight checks, layered on top of
/// [`tardis::TardisError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Bad arguments, an unknown config name, or a missing directory id.
    #[error("usage error: {0}")]
    Usage(String),

    /// A privileged operation was invoked without the superuser.
    #[error("permission error: {0}")]
    Permission(String),

    /// An error from one of the core subsystems.
    #[error(transparent)]
    Core(#[from] tardis::TardisError),
}

impl Error {
    /// Maps to the process exit code spec.md §4.7/§7 requires.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => tardis::exit::USAGE,
            Self::Permission(_) => tardis::exit::NOPERM,
            Self::Core(inner) => inner.exit_code(),
        }
    }
}
