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

//! Diagnostic output. The client side of Tardis greps stderr for
//! `/^ERROR:/` to decide whether to abort a run, so that prefix is only
//! ever emitted from [`error`]. Everything else is informational and must
//! never start with it.

use std::fmt::Display;
use std::time::Instant;

/// Prints a human-readable success line to stdout.
pub fn info<M: Display>(msg: M) {
    println!("{msg}");
}

/// Prints a non-fatal diagnostic to stderr. Never prefixed with `ERROR:` —
/// the client must not treat this as a reason to abort.
pub fn warn<M: Display>(msg: M) {
    eprintln!("[warn] {msg}");
}

/// Prints a fatal diagnostic to stderr in the form the client greps for.
pub fn error<M: Display>(msg: M) {
    eprintln!("ERROR: {msg}");
}

/// Starts a timer for a long-running operation (rotation, dump eviction).
pub fn start_timer() -> Instant {
    Instant::now()
}

/// Reports the elapsed time since `started_at` as part of a completion
/// message, e.g. `diag::info(format!("rotation complete ({})",
/// diag::stop_timer(started_at)))`.
pub fn stop_timer(started_at: Instant) -> String {
    let elapsed = started_at.elapsed();
    format!("{:.1}s", elapsed.as_secs_f64())
}
