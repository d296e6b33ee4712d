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

//! Core subsystems backing a Tardis backup server: config parsing, free
//! space probing, image lifecycle management, snapshot ring rotation,
//! and dump directory retention. `tardisd` is a thin CLI shell around
//! this crate.

mod error;
pub use error::*;

pub mod config;
pub mod diag;
pub mod dumpstore;
pub mod fsprobe;
pub mod image;
pub mod meta;
pub mod size;
pub mod snapshot;
