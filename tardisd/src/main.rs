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

//! `tardisd`: the short-lived server-side entry point, one invocation per
//! operation. Dispatches to the four subcommands spec.md §6 requires and
//! runs the preflight every one of them shares.

mod error;

use error::Error;

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;

use tardis::config::TardisConfig;
use tardis::{diag, dumpstore, image, meta, size, snapshot};

#[derive(Parser)]
#[command(name = "tardisd", about = "Tardis backup server operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount or unmount a tree's image.
    Dircontrol {
        config: String,
        dir_id: String,
        action: MountAction,
    },
    /// Admit space for the next rsync and rotate the snapshot ring.
    Increment {
        config: String,
        dir_id: String,
        bytes: String,
        inodes: String,
    },
    /// Stamp `backup.0` with its completion timestamp.
    Marksnapshot {
        config: String,
        dir_id: String,
        timestamp: String,
    },
    /// Admit space in the dump directory for an incoming dump file.
    Cleanup { config: String, bytes: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MountAction {
    Mount,
    Umount,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(tardis::exit::OK as u8),
        Err(err) => {
            diag::error(&err);
            ExitCode::from(err.exit_code().clamp(0, 255) as u8)
        }
    }
}

fn run() -> Result<(), Error> {
    match Cli::parse().command {
        Command::Dircontrol {
            config,
            dir_id,
            action,
        } => cmd_dircontrol(&config, &dir_id, action),
        Command::Increment {
            config,
            dir_id,
            bytes,
            inodes,
        } => cmd_increment(&config, &dir_id, &bytes, &inodes),
        Command::Marksnapshot {
            config,
            dir_id,
            timestamp,
        } => cmd_marksnapshot(&config, &dir_id, &timestamp),
        Command::Cleanup { config, bytes } => cmd_cleanup(&config, &bytes),
    }
}

fn cmd_dircontrol(config_name: &str, dir_id: &str, action: MountAction) -> Result<(), Error> {
    require_root("dircontrol")?;
    let config_path = preflight(config_name)?;
    let config = TardisConfig::load(&config_path)?;
    let tree = require_tree(&config, parse_dir_id(dir_id)?)?;

    let image_path = config.image_path(tree)?;
    let mountpoint = config.mountpoint(tree)?;

    match action {
        MountAction::Mount => {
            image::ensure_mountpoint(&mountpoint)?;
            let outcome =
                image::ensure_image(&image_path, tree.max_size, config.fstype()?, &mkfs_args(config.fsopts()?))?;

            let owner = match outcome {
                image::EnsureImageOutcome::Created => Some((config.user()?, config.group()?)),
                image::EnsureImageOutcome::Exists => None,
            };

            match image::mount_image(
                &image_path,
                &mountpoint,
                config.fstype()?,
                config.mountargs()?,
                tree.max_size,
                owner,
            )? {
                image::MountOutcome::Matches => diag::info(format!(
                    "mounted {} ({})",
                    mountpoint.display(),
                    size::format_size(tree.max_size)
                )),
                image::MountOutcome::SizeMismatch { recorded_size } => diag::warn(format!(
                    "recorded image size {} does not match configured {}; continuing with the recorded size",
                    size::format_size(recorded_size),
                    size::format_size(tree.max_size)
                )),
            }
        }
        MountAction::Umount => {
            image::unmount_image(&mountpoint)?;
            diag::info(format!("unmounted {}", mountpoint.display()));
        }
    }

    Ok(())
}

fn cmd_increment(config_name: &str, dir_id: &str, bytes_arg: &str, inodes_arg: &str) -> Result<(), Error> {
    require_root("increment")?;
    let config_path = preflight(config_name)?;
    let config = TardisConfig::load(&config_path)?;
    let tree = require_tree(&config, parse_dir_id(dir_id)?)?;
    let mountpoint = config.mountpoint(tree)?;

    let req_bytes = size::parse_size(bytes_arg)?;
    let req_inodes: u64 = inodes_arg
        .parse()
        .map_err(|_| Error::Usage(format!("inodes must be numeric: {inodes_arg}")))?;

    let meta_path = mountpoint.join(meta::Meta::FILE_NAME);
    let mut meta = meta::Meta::load(&meta_path)?;

    let started = diag::start_timer();
    let reclaimed = snapshot::admit(&mountpoint, req_bytes, req_inodes, &mut meta, &meta_path, &config)?;
    if !reclaimed.is_empty() {
        diag::info(format!("reclaimed {} snapshot(s): {reclaimed:?}", reclaimed.len()));
    }

    snapshot::rotate(&mountpoint, &mut meta, &meta_path)?;
    diag::info(format!(
        "admitted {} / {} inodes in {}",
        size::format_size(req_bytes),
        req_inodes,
        diag::stop_timer(started)
    ));

    Ok(())
}

fn cmd_marksnapshot(config_name: &str, dir_id: &str, timestamp_arg: &str) -> Result<(), Error> {
    let config_path = preflight(config_name)?;
    let config = TardisConfig::load(&config_path)?;
    let tree = require_tree(&config, parse_dir_id(dir_id)?)?;
    let mountpoint = config.mountpoint(tree)?;

    let timestamp: i64 = timestamp_arg
        .parse()
        .map_err(|_| Error::Usage(format!("timestamp must be numeric: {timestamp_arg}")))?;

    let meta_path = mountpoint.join(meta::Meta::FILE_NAME);
    let mut meta = meta::Meta::load(&meta_path)?;
    snapshot::stamp(&mut meta, &meta_path, timestamp)?;
    diag::info(format!("stamped backup.0 at {timestamp}"));

    Ok(())
}

fn cmd_cleanup(config_name: &str, bytes_arg: &str) -> Result<(), Error> {
    let config_path = preflight(config_name)?;
    let config = TardisConfig::load(&config_path)?;
    let req_bytes = size::parse_size(bytes_arg)?;
    let dump_dir = config.dump_dir()?;

    let report = dumpstore::admit_dump(&dump_dir, req_bytes, &config)?;
    dumpstore::check_physical_headroom(&dump_dir, req_bytes)?;

    if !report.evicted.is_empty() {
        diag::info(format!(
            "evicted {} dump(s), freed {}",
            report.evicted.len(),
            size::format_size(report.freed_bytes)
        ));
    }
    diag::info(format!(
        "admitted dump of {} (previously used: {})",
        size::format_size(req_bytes),
        size::format_size(report.used_before)
    ));

    Ok(())
}

/// Parses a `dir-id` argument. Non-numeric input is a usage error (spec.md
/// §7: "non-numeric where required" → exit 64); a numeric id that doesn't
/// name a configured tree is a config error (§7: "missing referenced
/// directory id" → exit 74), handled separately by [`require_tree`].
fn parse_dir_id(raw: &str) -> Result<u32, Error> {
    raw.parse()
        .map_err(|_| Error::Usage(format!("dir-id must be numeric: {raw}")))
}

fn require_tree(config: &TardisConfig, dir_id: u32) -> Result<&tardis::config::TreeDescriptor, Error> {
    config.tree(dir_id).ok_or_else(|| {
        Error::Core(tardis::TardisError::Config(format!(
            "no such directory id: {dir_id}"
        )))
    })
}

fn mkfs_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Clears the environment down to a fixed `PATH`, derives the install
/// root from the running executable's location, and validates the
/// config name before resolving it under `<root>/config/`.
fn preflight(config_name: &str) -> Result<PathBuf, Error> {
    clear_environment();

    let name_pattern = Regex::new(r"^\w+$").expect("valid regex literal");
    if !name_pattern.is_match(config_name) {
        return Err(Error::Usage(format!(
            "config name must match ^\\w+$, got \"{config_name}\""
        )));
    }

    let config_path = install_root()?.join("config").join(config_name);
    if !config_path.is_file() {
        return Err(Error::Usage(format!(
            "no such config: {} ({})",
            config_name,
            config_path.display()
        )));
    }

    Ok(config_path)
}

fn clear_environment() {
    const TAINTED: &[&str] = &["PATH", "IFS", "ENV", "BASH_ENV", "LD_PRELOAD", "LD_LIBRARY_PATH"];
    for key in TAINTED {
        env::remove_var(key);
    }
    env::set_var("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
}

fn install_root() -> Result<PathBuf, Error> {
    let exe = env::current_exe()
        .map_err(|e| Error::Usage(format!("cannot determine install root: {e}")))?;
    let bin_dir: &Path = exe
        .parent()
        .ok_or_else(|| Error::Usage("executable has no parent directory".to_string()))?;
    Ok(bin_dir.parent().unwrap_or(bin_dir).to_path_buf())
}

fn require_root(operation: &str) -> Result<(), Error> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::Permission(format!("{operation} must run as root")));
    }
    Ok(())
}
