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

//! The ConfigStore: a line-oriented INI dialect with sections, quoted and
//! unquoted values, and one-pass `${section,key}` variable substitution.
//! Used both for the operator config file and for the per-image
//! `.tardis_meta` metadata file (same grammar, different sections).

use crate::error::TardisError;
use crate::size;

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use regex::Regex;

/// The section pairs appearing before the first `[section]` header fall
/// into this distinguished section.
pub const DEFAULT_SECTION: &str = "";

/// A parsed INI-dialect document: section name → (key → value).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    modified: bool,
}

impl Config {
    /// Returns a new, empty `Config`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the INI-dialect text, substitutes `${section,key}` references
    /// in a single pass, and returns the result. `modified` starts `false`.
    pub fn parse(text: &str) -> Result<Self, TardisError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = DEFAULT_SECTION.to_string();
        sections.entry(current.clone()).or_default();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line_number = lineno + 1;
            let trimmed = raw_line.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let end = rest.find(']').ok_or_else(|| TardisError::Syntax {
                    line: line_number,
                    message: "unterminated section header".to_string(),
                })?;
                current = rest[..end].to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let eq_idx = trimmed.find('=').ok_or_else(|| TardisError::Syntax {
                line: line_number,
                message: "expected \"key = value\" or a section header".to_string(),
            })?;

            let key = trimmed[..eq_idx].trim();
            if key.is_empty() {
                return Err(TardisError::Syntax {
                    line: line_number,
                    message: "empty key".to_string(),
                });
            }

            let rest = trimmed[eq_idx + 1..].trim_start();
            let value = if let Some(quoted) = rest.strip_prefix('"') {
                let end = quoted.find('"').ok_or_else(|| TardisError::Syntax {
                    line: line_number,
                    message: "unterminated quoted value".to_string(),
                })?;
                quoted[..end].to_string()
            } else {
                let unquoted = match rest.find(['#', ';']) {
                    Some(pos) => &rest[..pos],
                    None => rest,
                };
                unquoted.trim().to_string()
            };

            sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value);
        }

        let mut config = Self {
            sections,
            modified: false,
        };
        config.resolve_variables();
        Ok(config)
    }

    /// Loads a config file from `path`, refusing to proceed if the file's
    /// permission bits allow group or world access beyond the strict
    /// `0600` ceiling (spec.md §3: "Config files carry secrets").
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TardisError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;

        let mode = metadata.permissions().mode();
        if mode & !0o600 & 0o777 != 0 {
            return Err(TardisError::Permission(format!(
                "{} is readable or writable by group/other (mode {:o}); refusing to load",
                path.display(),
                mode & 0o777
            )));
        }

        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Writes the config to `path` with mode `0600`, skipping the write
    /// entirely unless `force` is set or the config has pending
    /// modifications (see [`Config::set`]).
    pub fn save(&mut self, path: impl AsRef<Path>, force: bool) -> Result<(), TardisError> {
        if !self.modified && !force {
            return Ok(());
        }

        let rendered = self.render(&HashSet::new());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path.as_ref())?;
        file.write_all(rendered.as_bytes())?;

        self.modified = false;
        Ok(())
    }

    /// Reports whether [`Config::set`] has been called since the last
    /// successful [`Config::save`].
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Returns the value of `key` in `section`, if present.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// Sets `key` in `section` to `value`, creating the section if
    /// necessary, and marks the config as modified.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self.modified = true;
    }

    /// Removes `key` from `section`, marking the config as modified if the
    /// key was present. Returns the removed value.
    pub fn remove(&mut self, section: &str, key: &str) -> Option<String> {
        let removed = self.sections.get_mut(section)?.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    /// Returns the keys present in `section`, sorted.
    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Returns the names of all sections that have at least one entry,
    /// excluding the distinguished default section, sorted.
    pub fn section_names(&self) -> Vec<&str> {
        self.sections
            .keys()
            .filter(|name| name.as_str() != DEFAULT_SECTION)
            .map(String::as_str)
            .collect()
    }

    /// Substitutes every `${section,key}` reference across all values with
    /// the referenced value (or the empty string if absent), in a single
    /// pass over a snapshot taken before any substitution. Nested
    /// references are therefore not guaranteed to resolve — see
    /// DESIGN.md's note on upgrading to fixpoint iteration.
    fn resolve_variables(&mut self) {
        let reference = Regex::new(r"\$\{([^,}]+),([^}]+)\}").expect("valid regex literal");
        let snapshot = self.sections.clone();

        for section in self.sections.values_mut() {
            for value in section.values_mut() {
                if !reference.is_match(value) {
                    continue;
                }

                let resolved = reference.replace_all(value, |caps: &regex::Captures| {
                    let ref_section = &caps[1];
                    let ref_key = &caps[2];
                    snapshot
                        .get(ref_section)
                        .and_then(|s| s.get(ref_key))
                        .cloned()
                        .unwrap_or_default()
                });
                *value = resolved.into_owned();
            }
        }
    }

    /// Renders the config back to text: sections in sorted order, every
    /// value quoted, `skip` omitting selected sections entirely. The
    /// default section (if non-empty) is emitted first without a header.
    pub fn render(&self, skip: &HashSet<String>) -> String {
        let mut out = String::new();

        if let Some(default) = self.sections.get(DEFAULT_SECTION) {
            for (key, value) in default {
                out.push_str(&format!("{key} = \"{value}\"\n"));
            }
            if !default.is_empty() {
                out.push('\n');
            }
        }

        for (name, pairs) in &self.sections {
            if name == DEFAULT_SECTION || skip.contains(name) {
                continue;
            }

            out.push_str(&format!("[{name}]\n"));
            for (key, value) in pairs {
                out.push_str(&format!("{key} = \"{value}\"\n"));
            }
            out.push('\n');
        }

        out
    }
}

/// A tree descriptor: one per backup tree (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeDescriptor {
    pub id: u32,
    pub name: String,
    pub local_path: Option<String>,
    pub remote_dir: String,
    pub max_size: u64,
    pub exclude: Vec<String>,
    pub exclude_file: Option<String>,
}

/// A dump descriptor: one per database dump job (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpDescriptor {
    pub id: u32,
    pub dump_type: String,
    pub credentials: String,
    pub db_name: String,
    pub dump_name: String,
}

/// A typed view over a raw [`Config`] exposing the `server` section and
/// the indexed `directory.N` / `database.N` tree and dump descriptors
/// required by spec.md §6.
pub struct TardisConfig {
    raw: Config,
    trees: BTreeMap<u32, TreeDescriptor>,
    dumps: BTreeMap<u32, DumpDescriptor>,
}

impl TardisConfig {
    /// Loads and type-checks the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TardisError> {
        let raw = Config::load(path)?;
        Self::from_raw(raw)
    }

    pub(crate) fn from_raw(raw: Config) -> Result<Self, TardisError> {
        let mut trees = BTreeMap::new();
        let mut dumps = BTreeMap::new();

        for section in raw.section_names() {
            if let Some(idx) = section.strip_prefix("directory.") {
                let idx: u32 = idx
                    .parse()
                    .map_err(|_| TardisError::Config(format!("bad directory index \"{section}\"")))?;
                trees.insert(idx, parse_tree(&raw, section)?);
            } else if let Some(idx) = section.strip_prefix("database.") {
                let idx: u32 = idx
                    .parse()
                    .map_err(|_| TardisError::Config(format!("bad database index \"{section}\"")))?;
                dumps.insert(idx, parse_dump(&raw, section)?);
            }
        }

        Ok(Self { raw, trees, dumps })
    }

    fn require(&self, section: &str, key: &str) -> Result<&str, TardisError> {
        self.raw
            .get(section, key)
            .ok_or_else(|| TardisError::Config(format!("missing [{section}] {key}")))
    }

    pub fn base(&self) -> Result<&str, TardisError> {
        self.require("server", "base")
    }

    pub fn dbdir(&self) -> Result<&str, TardisError> {
        self.require("server", "dbdir")
    }

    pub fn dbsize(&self) -> Result<u64, TardisError> {
        size::parse_size(self.require("server", "dbsize")?)
    }

    pub fn bytebuffer(&self) -> Result<u64, TardisError> {
        size::parse_size(self.require("server", "bytebuffer")?)
    }

    pub fn inodebuffer(&self) -> Result<u64, TardisError> {
        self.require("server", "inodebuffer")?
            .parse()
            .map_err(|_| TardisError::Config("server.inodebuffer is not numeric".to_string()))
    }

    pub fn forcedbs(&self) -> Result<usize, TardisError> {
        self.require("server", "forcedbs")?
            .parse()
            .map_err(|_| TardisError::Config("server.forcedbs is not numeric".to_string()))
    }

    pub fn forcesnaps(&self) -> Result<usize, TardisError> {
        self.require("server", "forcesnaps")?
            .parse()
            .map_err(|_| TardisError::Config("server.forcesnaps is not numeric".to_string()))
    }

    pub fn fstype(&self) -> Result<&str, TardisError> {
        self.require("server", "fstype")
    }

    pub fn fsopts(&self) -> Result<&str, TardisError> {
        self.require("server", "fsopts")
    }

    pub fn mountargs(&self) -> Result<&str, TardisError> {
        self.require("server", "mountargs")
    }

    pub fn user(&self) -> Result<&str, TardisError> {
        self.require("server", "user")
    }

    pub fn group(&self) -> Result<&str, TardisError> {
        self.require("server", "group")
    }

    pub fn tree(&self, id: u32) -> Option<&TreeDescriptor> {
        self.trees.get(&id)
    }

    pub fn trees(&self) -> impl Iterator<Item = &TreeDescriptor> {
        self.trees.values()
    }

    pub fn dump(&self, id: u32) -> Option<&DumpDescriptor> {
        self.dumps.get(&id)
    }

    pub fn dumps(&self) -> impl Iterator<Item = &DumpDescriptor> {
        self.dumps.values()
    }

    /// The path of the sparse image file for `tree`: `<base>/<remotedir>.timg`.
    pub fn image_path(&self, tree: &TreeDescriptor) -> Result<std::path::PathBuf, TardisError> {
        Ok(Path::new(self.base()?).join(format!("{}.timg", tree.remote_dir)))
    }

    /// The mountpoint for `tree`: `<base>/<remotedir>`.
    pub fn mountpoint(&self, tree: &TreeDescriptor) -> Result<std::path::PathBuf, TardisError> {
        Ok(Path::new(self.base()?).join(&tree.remote_dir))
    }

    /// The dump directory: `<base>/<dbdir>`.
    pub fn dump_dir(&self) -> Result<std::path::PathBuf, TardisError> {
        Ok(Path::new(self.base()?).join(self.dbdir()?))
    }
}

fn parse_tree(raw: &Config, section: &str) -> Result<TreeDescriptor, TardisError> {
    let id = raw
        .get(section, "id")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing id")))?
        .parse()
        .map_err(|_| TardisError::Config(format!("[{section}] id is not numeric")))?;
    let name = raw
        .get(section, "name")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing name")))?
        .to_string();
    let remote_dir = raw
        .get(section, "remotedir")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing remotedir")))?
        .to_string();
    let max_size = size::parse_size(
        raw.get(section, "maxsize")
            .ok_or_else(|| TardisError::Config(format!("[{section}] missing maxsize")))?,
    )?;
    let local_path = raw.get(section, "localpath").map(str::to_string);
    let exclude = raw
        .get(section, "exclude")
        .map(|s| s.split(',').map(|item| item.trim().to_string()).collect())
        .unwrap_or_default();
    let exclude_file = raw.get(section, "excludefile").map(str::to_string);

    Ok(TreeDescriptor {
        id,
        name,
        local_path,
        remote_dir,
        max_size,
        exclude,
        exclude_file,
    })
}

fn parse_dump(raw: &Config, section: &str) -> Result<DumpDescriptor, TardisError> {
    let id = raw
        .get(section, "id")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing id")))?
        .parse()
        .map_err(|_| TardisError::Config(format!("[{section}] id is not numeric")))?;
    let dump_type = raw
        .get(section, "type")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing type")))?
        .to_string();
    let credentials = raw.get(section, "credentials").unwrap_or_default().to_string();
    let db_name = raw.get(section, "dbname").unwrap_or_default().to_string();
    let dump_name = raw
        .get(section, "dumpname")
        .ok_or_else(|| TardisError::Config(format!("[{section}] missing dumpname")))?
        .to_string();

    Ok(DumpDescriptor {
        id,
        dump_type,
        credentials,
        db_name,
        dump_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_quoted_values() {
        let text = "\
[server]
base = \"/srv/tardis\"
dbsize = 5G # inline comment
; a full-line comment
forcesnaps = 7
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.get("server", "base"), Some("/srv/tardis"));
        assert_eq!(config.get("server", "dbsize"), Some("5G"));
        assert_eq!(config.get("server", "forcesnaps"), Some("7"));
    }

    #[test]
    fn pairs_before_first_header_go_to_default_section() {
        let text = "root = \"yes\"\n[server]\nbase = \"/srv\"\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.get(DEFAULT_SECTION, "root"), Some("yes"));
    }

    #[test]
    fn rejects_malformed_lines() {
        let text = "not a valid line at all\n";
        match Config::parse(text) {
            Err(TardisError::Syntax { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn resolves_variable_references_in_one_pass() {
        let text = "\
[paths]
base = \"/srv/tardis\"
[server]
base = \"${paths,base}\"
missing = \"${paths,nope}\"
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.get("server", "base"), Some("/srv/tardis"));
        assert_eq!(config.get("server", "missing"), Some(""));
    }

    #[test]
    fn write_then_parse_round_trips() {
        let mut config = Config::new();
        config.set("server", "base", "/srv/tardis");
        config.set("server", "dbsize", "5G");
        config.set("paths", "etc", "/etc/tardis");

        let rendered = config.render(&HashSet::new());
        let reparsed = Config::parse(&rendered).unwrap();

        assert_eq!(reparsed.get("server", "base"), Some("/srv/tardis"));
        assert_eq!(reparsed.get("server", "dbsize"), Some("5G"));
        assert_eq!(reparsed.get("paths", "etc"), Some("/etc/tardis"));
    }

    #[test]
    fn render_skips_selected_sections() {
        let mut config = Config::new();
        config.set("server", "base", "/srv/tardis");
        config.set("secret", "key", "hunter2");

        let mut skip = HashSet::new();
        skip.insert("secret".to_string());

        let rendered = config.render(&skip);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("/srv/tardis"));
    }

    #[test]
    fn save_is_gated_by_modified_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tardis.conf");

        let mut config = Config::new();
        config.save(&path, false).unwrap();
        assert!(!path.exists(), "unmodified config with force=false must not write");

        config.set("server", "base", "/srv/tardis");
        config.save(&path, false).unwrap();
        assert!(path.exists());
        assert!(!config.is_modified());
    }

    #[test]
    fn load_rejects_group_or_world_readable_file() {
        use std::fs::OpenOptions;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tardis.conf");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .mode(0o644)
                .open(&path)
                .unwrap();
            file.write_all(b"[server]\nbase = \"/srv\"\n").unwrap();
        }

        match Config::load(&path) {
            Err(TardisError::Permission(_)) => {}
            other => panic!("expected permission error, got {other:?}"),
        }
    }

    #[test]
    fn typed_config_parses_tree_and_dump_descriptors() {
        let text = "\
[server]
base = \"/srv/tardis\"
dbdir = \"dumps\"
dbsize = \"5G\"
bytebuffer = \"200M\"
inodebuffer = \"1000\"
forcedbs = \"7\"
forcesnaps = \"7\"
fstype = \"xfs\"
fsopts = \"\"
mountargs = \"\"
user = \"thedoctor\"
group = \"thedoctor\"

[directory.0]
id = \"0\"
name = \"home\"
remotedir = \"home0\"
maxsize = \"40G\"

[database.0]
id = \"0\"
type = \"mysql\"
dumpname = \"maindb\"
";
        let raw = Config::parse(text).unwrap();
        let typed = TardisConfig::from_raw(raw).unwrap();

        assert_eq!(typed.base().unwrap(), "/srv/tardis");
        assert_eq!(typed.forcesnaps().unwrap(), 7);

        let tree = typed.tree(0).unwrap();
        assert_eq!(tree.remote_dir, "home0");
        assert_eq!(tree.max_size, 40 * (1u64 << 30));

        let dump = typed.dump(0).unwrap();
        assert_eq!(dump.dump_name, "maindb");
    }
}
