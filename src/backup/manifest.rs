//! The backup manifest.
//!
//! In-memory and on-disk record of everything a backup contains:
//! targets (the data directory and each tablespace), every path, file
//! and link below them, the cluster identity, and the options the
//! backup ran under. The on-disk form is sectioned INI text whose
//! values are JSON atoms, guarded by a SHA-1 over the whole file.
//!
//! Unrecognized sections and keys survive a load/save round trip, so a
//! newer writer's manifest is not damaged by an older reader.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{bail, format_err, Error};
use serde_json::{json, Value};

use crate::config::{BackupType, CipherType, CompressType};
use crate::error::BackupError;
use crate::pg;

pub const MANIFEST_NAME: &str = "backup.manifest";
pub const MANIFEST_COPY_NAME: &str = "backup.manifest.copy";
pub const MANIFEST_FORMAT: u32 = 5;

/// The implicit primary target.
pub const TARGET_PGDATA: &str = "pg_data";
/// Prefix of tablespace target names.
pub const TARGET_PGTBLSPC: &str = "pg_tblspc";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Path,
    Link,
}

impl TargetKind {
    fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Path => "path",
            TargetKind::Link => "link",
        }
    }
}

/// One top-level backup source.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetEntry {
    pub kind: TargetKind,
    pub path: String,
    pub tablespace_id: Option<u64>,
    pub tablespace_name: Option<String>,
    pub extra: serde_json::Map<String, Value>,
}

/// A directory inside a target.
#[derive(Clone, Debug, PartialEq)]
pub struct PathEntry {
    pub mode: String,
    pub user: String,
    pub group: String,
    pub extra: serde_json::Map<String, Value>,
}

/// A regular file inside a target.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    /// Authoritative size read from the source.
    pub size: u64,
    /// Size in the repository after compression/encryption; unset
    /// until the file has been copied.
    pub repo_size: Option<u64>,
    pub timestamp: i64,
    /// SHA-1 of the source bytes; unset until copied.
    pub checksum: Option<String>,
    /// Label of the prior backup storing this file's bytes.
    pub reference: Option<String>,
    /// Result of page validation, when attempted.
    pub checksum_page: Option<bool>,
    /// Compact list of failing pages and ranges, e.g. `[0,[2,3]]`.
    pub checksum_page_error: Option<Value>,
    /// File must be read from the primary, never a standby.
    pub master: bool,
    pub mode: String,
    pub user: String,
    pub group: String,
    pub extra: serde_json::Map<String, Value>,
}

/// A symbolic link inside a target.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkEntry {
    pub destination: String,
    pub user: String,
    pub group: String,
    pub extra: serde_json::Map<String, Value>,
}

/// `[backup]` header section.
#[derive(Clone, Debug, PartialEq)]
pub struct BackupHeader {
    pub label: String,
    pub prior: Option<String>,
    pub backup_type: BackupType,
    pub timestamp_start: i64,
    pub timestamp_copy_start: i64,
    pub timestamp_stop: Option<i64>,
    pub lsn_start: Option<String>,
    pub lsn_stop: Option<String>,
    pub wal_start: Option<String>,
    pub wal_stop: Option<String>,
}

/// `[backup:option]` header section: the settings this backup was
/// taken under. Resume compatibility is decided against these.
#[derive(Clone, Debug, PartialEq)]
pub struct OptionHeader {
    pub online: bool,
    pub compress_type: CompressType,
    pub compress_level: u32,
    pub cipher_type: CipherType,
    pub hardlink: bool,
    pub checksum_page: bool,
    pub backup_standby: bool,
    pub buffer_size: usize,
    pub process_max: usize,
    pub delta: bool,
    pub archive_check: bool,
    pub archive_copy: bool,
}

/// `[backup:db]` section: cluster identity.
#[derive(Clone, Debug, PartialEq)]
pub struct DbInfo {
    pub version: u32,
    pub system_id: u64,
    pub control_version: u32,
    pub catalog_version: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Engine version recorded in `[backrest]`; resume refuses a
    /// partial written by a different version.
    pub version: String,
    pub backup: BackupHeader,
    pub options: OptionHeader,
    pub db: DbInfo,
    targets: BTreeMap<String, TargetEntry>,
    paths: BTreeMap<String, PathEntry>,
    files: BTreeMap<String, FileEntry>,
    links: BTreeMap<String, LinkEntry>,
    /// section name -> key -> raw JSON text, for anything unrecognized.
    unknown: BTreeMap<String, BTreeMap<String, String>>,
}

impl Manifest {
    pub fn new(backup: BackupHeader, options: OptionHeader, db: DbInfo) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            backup,
            options,
            db,
            targets: BTreeMap::new(),
            paths: BTreeMap::new(),
            files: BTreeMap::new(),
            links: BTreeMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    pub fn target_add(&mut self, name: String, target: TargetEntry) {
        self.targets.insert(name, target);
    }

    pub fn path_add(&mut self, name: String, path: PathEntry) {
        self.paths.insert(name, path);
    }

    pub fn file_add(&mut self, name: String, file: FileEntry) {
        self.files.insert(name, file);
    }

    pub fn link_add(&mut self, name: String, link: LinkEntry) {
        self.links.insert(name, link);
    }

    pub fn file_remove(&mut self, name: &str) -> Option<FileEntry> {
        self.files.remove(name)
    }

    /// Look up a file entry; a missing name is an internal error.
    pub fn file(&self, name: &str) -> Result<&FileEntry, Error> {
        self.files.get(name).ok_or_else(|| {
            BackupError::Assert(format!("manifest does not contain file '{}'", name)).into()
        })
    }

    pub fn file_mut(&mut self, name: &str) -> Result<&mut FileEntry, Error> {
        self.files.get_mut(name).ok_or_else(|| {
            BackupError::Assert(format!("manifest does not contain file '{}'", name)).into()
        })
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn path_exists(&self, name: &str) -> bool {
        self.paths.contains_key(name)
    }

    pub fn target(&self, name: &str) -> Result<&TargetEntry, Error> {
        self.targets.get(name).ok_or_else(|| {
            BackupError::Assert(format!("manifest does not contain target '{}'", name)).into()
        })
    }

    /// Point a file at its copy in a prior backup. The file then
    /// contributes nothing to this backup's repository size.
    pub fn set_reference(&mut self, name: &str, label: &str) -> Result<(), Error> {
        let file = self.file_mut(name)?;
        file.reference = Some(label.to_string());
        file.repo_size = Some(0);
        Ok(())
    }

    pub fn targets(&self) -> impl Iterator<Item = (&String, &TargetEntry)> {
        self.targets.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = (&String, &PathEntry)> {
        self.paths.iter()
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = (&String, &mut FileEntry)> {
        self.files.iter_mut()
    }

    pub fn links(&self) -> impl Iterator<Item = (&String, &LinkEntry)> {
        self.links.iter()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of source sizes of all files.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    fn parent_path(name: &str) -> Option<&str> {
        name.rfind('/').map(|pos| &name[..pos])
    }

    /// Structural invariants enforced before every save.
    pub fn validate(&self) -> Result<(), Error> {
        match self.targets.get(TARGET_PGDATA) {
            Some(target) if target.kind == TargetKind::Path => {}
            _ => {
                return Err(BackupError::Assert(
                    "manifest is missing the pg_data path target".to_string(),
                )
                .into())
            }
        }

        for (name, target) in &self.targets {
            if let Some(id) = target.tablespace_id {
                let expected = format!("{}/{}", TARGET_PGTBLSPC, id);
                if name != &expected {
                    return Err(BackupError::Assert(format!(
                        "tablespace target '{}' must be named '{}'",
                        name, expected
                    ))
                    .into());
                }
            }
        }

        let name_in_targets = |name: &str| {
            self.targets
                .keys()
                .any(|t| name == t || name.starts_with(&format!("{}/", t)))
        };

        for name in self
            .paths
            .keys()
            .chain(self.files.keys())
            .chain(self.links.keys())
        {
            if !name_in_targets(name) {
                return Err(BackupError::Assert(format!(
                    "'{}' does not belong to any target",
                    name
                ))
                .into());
            }
        }

        for name in self.files.keys().chain(self.links.keys()) {
            let parent = match Self::parent_path(name) {
                Some(parent) => parent,
                None => {
                    return Err(BackupError::Assert(format!(
                        "'{}' has no containing path",
                        name
                    ))
                    .into())
                }
            };
            if !self.paths.contains_key(parent) {
                return Err(BackupError::Assert(format!(
                    "containing path '{}' of '{}' is not in the manifest",
                    parent, name
                ))
                .into());
            }
        }

        if self.backup.backup_type == BackupType::Full {
            if let Some((name, _)) = self.files.iter().find(|(_, f)| f.reference.is_some()) {
                return Err(BackupError::Assert(format!(
                    "full backup cannot reference prior backups (file '{}')",
                    name
                ))
                .into());
            }
        }

        Ok(())
    }

    // ---- persistence ----

    fn most_common<'a, I: Iterator<Item = &'a str>>(values: I, fallback: &str) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for value in values {
            *counts.entry(value).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(value, _)| value.to_string())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn most_common_bool<I: Iterator<Item = bool>>(values: I, fallback: bool) -> bool {
        let mut yes = 0usize;
        let mut no = 0usize;
        for value in values {
            if value {
                yes += 1
            } else {
                no += 1
            }
        }
        if yes == 0 && no == 0 {
            fallback
        } else {
            yes >= no
        }
    }

    fn emit_section(
        out: &mut Vec<u8>,
        name: &str,
        mut keys: Vec<(String, String)>,
        unknown: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), Error> {
        if let Some(extra) = unknown.get(name) {
            for (key, raw) in extra {
                keys.push((key.clone(), raw.clone()));
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        keys.sort();
        writeln!(out, "[{}]", name)?;
        for (key, value) in keys {
            writeln!(out, "{}={}", key, value)?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn file_to_value(file: &FileEntry, default: &FileDefaults) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(ref checksum) = file.checksum {
            map.insert("checksum".to_string(), json!(checksum));
        }
        if let Some(valid) = file.checksum_page {
            map.insert("checksum-page".to_string(), json!(valid));
        }
        if let Some(ref error) = file.checksum_page_error {
            map.insert("checksum-page-error".to_string(), error.clone());
        }
        if file.group != default.group {
            map.insert("group".to_string(), json!(file.group));
        }
        if file.master != default.master {
            map.insert("master".to_string(), json!(file.master));
        }
        if file.mode != default.mode {
            map.insert("mode".to_string(), json!(file.mode));
        }
        if let Some(ref reference) = file.reference {
            map.insert("reference".to_string(), json!(reference));
        }
        if let Some(repo_size) = file.repo_size {
            map.insert("repo-size".to_string(), json!(repo_size));
        }
        map.insert("size".to_string(), json!(file.size));
        map.insert("timestamp".to_string(), json!(file.timestamp));
        if file.user != default.user {
            map.insert("user".to_string(), json!(file.user));
        }
        for (key, value) in &file.extra {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Serialize to the on-disk text, including the integrity header.
    pub fn save(&self) -> Result<Vec<u8>, Error> {
        self.validate()?;

        let mut body = Vec::new();

        // [backrest] with the checksum placeholder; computed last
        writeln!(body, "[backrest]")?;
        writeln!(body, "backrest-checksum=\"\"")?;
        writeln!(body, "backrest-format={}", MANIFEST_FORMAT)?;
        writeln!(body, "backrest-version={}", json!(self.version))?;
        if let Some(extra) = self.unknown.get("backrest") {
            for (key, raw) in extra {
                writeln!(body, "{}={}", key, raw)?;
            }
        }
        writeln!(body)?;

        let mut keys = vec![
            ("backup-label".to_string(), json!(self.backup.label).to_string()),
            (
                "backup-timestamp-copy-start".to_string(),
                self.backup.timestamp_copy_start.to_string(),
            ),
            (
                "backup-timestamp-start".to_string(),
                self.backup.timestamp_start.to_string(),
            ),
            (
                "backup-type".to_string(),
                json!(self.backup.backup_type.as_str()).to_string(),
            ),
        ];
        if let Some(ref prior) = self.backup.prior {
            keys.push(("backup-prior".to_string(), json!(prior).to_string()));
        }
        if let Some(stop) = self.backup.timestamp_stop {
            keys.push(("backup-timestamp-stop".to_string(), stop.to_string()));
        }
        if let Some(ref lsn) = self.backup.lsn_start {
            keys.push(("backup-lsn-start".to_string(), json!(lsn).to_string()));
        }
        if let Some(ref lsn) = self.backup.lsn_stop {
            keys.push(("backup-lsn-stop".to_string(), json!(lsn).to_string()));
        }
        if let Some(ref wal) = self.backup.wal_start {
            keys.push(("backup-wal-start".to_string(), json!(wal).to_string()));
        }
        if let Some(ref wal) = self.backup.wal_stop {
            keys.push(("backup-wal-stop".to_string(), json!(wal).to_string()));
        }
        Self::emit_section(&mut body, "backup", keys, &self.unknown)?;

        let keys = vec![
            (
                "db-catalog-version".to_string(),
                self.db.catalog_version.to_string(),
            ),
            (
                "db-control-version".to_string(),
                self.db.control_version.to_string(),
            ),
            ("db-system-id".to_string(), self.db.system_id.to_string()),
            (
                "db-version".to_string(),
                json!(pg::version_to_str(self.db.version)).to_string(),
            ),
        ];
        Self::emit_section(&mut body, "backup:db", keys, &self.unknown)?;

        let keys = vec![
            (
                "option-archive-check".to_string(),
                self.options.archive_check.to_string(),
            ),
            (
                "option-archive-copy".to_string(),
                self.options.archive_copy.to_string(),
            ),
            (
                "option-backup-standby".to_string(),
                self.options.backup_standby.to_string(),
            ),
            (
                "option-buffer-size".to_string(),
                self.options.buffer_size.to_string(),
            ),
            (
                "option-checksum-page".to_string(),
                self.options.checksum_page.to_string(),
            ),
            (
                "option-cipher-type".to_string(),
                json!(self.options.cipher_type.as_str()).to_string(),
            ),
            (
                "option-compress-level".to_string(),
                self.options.compress_level.to_string(),
            ),
            (
                "option-compress-type".to_string(),
                json!(self.options.compress_type.as_str()).to_string(),
            ),
            ("option-delta".to_string(), self.options.delta.to_string()),
            (
                "option-hardlink".to_string(),
                self.options.hardlink.to_string(),
            ),
            ("option-online".to_string(), self.options.online.to_string()),
            (
                "option-process-max".to_string(),
                self.options.process_max.to_string(),
            ),
        ];
        Self::emit_section(&mut body, "backup:option", keys, &self.unknown)?;

        let mut keys = Vec::new();
        for (name, target) in &self.targets {
            let mut map = serde_json::Map::new();
            map.insert("path".to_string(), json!(target.path));
            if let Some(id) = target.tablespace_id {
                map.insert("tablespace-id".to_string(), json!(id.to_string()));
            }
            if let Some(ref ts_name) = target.tablespace_name {
                map.insert("tablespace-name".to_string(), json!(ts_name));
            }
            map.insert("type".to_string(), json!(target.kind.as_str()));
            for (key, value) in &target.extra {
                map.insert(key.clone(), value.clone());
            }
            keys.push((name.clone(), Value::Object(map).to_string()));
        }
        Self::emit_section(&mut body, "backup:target", keys, &self.unknown)?;

        let file_default = FileDefaults {
            mode: Self::most_common(self.files.values().map(|f| f.mode.as_str()), "0640"),
            user: Self::most_common(self.files.values().map(|f| f.user.as_str()), ""),
            group: Self::most_common(self.files.values().map(|f| f.group.as_str()), ""),
            master: Self::most_common_bool(self.files.values().map(|f| f.master), true),
        };

        let mut keys = Vec::new();
        for (name, file) in &self.files {
            keys.push((name.clone(), Self::file_to_value(file, &file_default).to_string()));
        }
        Self::emit_section(&mut body, "target:file", keys, &self.unknown)?;

        if !self.files.is_empty() {
            let keys = vec![
                ("group".to_string(), json!(file_default.group).to_string()),
                ("master".to_string(), file_default.master.to_string()),
                ("mode".to_string(), json!(file_default.mode).to_string()),
                ("user".to_string(), json!(file_default.user).to_string()),
            ];
            Self::emit_section(&mut body, "target:file:default", keys, &self.unknown)?;
        }

        let mut keys = Vec::new();
        for (name, link) in &self.links {
            let mut map = serde_json::Map::new();
            map.insert("destination".to_string(), json!(link.destination));
            map.insert("group".to_string(), json!(link.group));
            map.insert("user".to_string(), json!(link.user));
            for (key, value) in &link.extra {
                map.insert(key.clone(), value.clone());
            }
            keys.push((name.clone(), Value::Object(map).to_string()));
        }
        Self::emit_section(&mut body, "target:link", keys, &self.unknown)?;

        let path_default = PathDefaults {
            mode: Self::most_common(self.paths.values().map(|p| p.mode.as_str()), "0750"),
            user: Self::most_common(self.paths.values().map(|p| p.user.as_str()), ""),
            group: Self::most_common(self.paths.values().map(|p| p.group.as_str()), ""),
        };

        let mut keys = Vec::new();
        for (name, path) in &self.paths {
            let mut map = serde_json::Map::new();
            if path.group != path_default.group {
                map.insert("group".to_string(), json!(path.group));
            }
            if path.mode != path_default.mode {
                map.insert("mode".to_string(), json!(path.mode));
            }
            if path.user != path_default.user {
                map.insert("user".to_string(), json!(path.user));
            }
            for (key, value) in &path.extra {
                map.insert(key.clone(), value.clone());
            }
            keys.push((name.clone(), Value::Object(map).to_string()));
        }
        Self::emit_section(&mut body, "target:path", keys, &self.unknown)?;

        if !self.paths.is_empty() {
            let keys = vec![
                ("group".to_string(), json!(path_default.group).to_string()),
                ("mode".to_string(), json!(path_default.mode).to_string()),
                ("user".to_string(), json!(path_default.user).to_string()),
            ];
            Self::emit_section(&mut body, "target:path:default", keys, &self.unknown)?;
        }

        // unknown sections with no known counterpart
        const KNOWN: &[&str] = &[
            "backrest",
            "backup",
            "backup:db",
            "backup:option",
            "backup:target",
            "target:file",
            "target:file:default",
            "target:link",
            "target:path",
            "target:path:default",
        ];
        for (section, keys) in &self.unknown {
            if KNOWN.contains(&section.as_str()) {
                continue;
            }
            let keys = keys
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>();
            Self::emit_section(&mut body, section, keys, &BTreeMap::new())?;
        }

        // fill in the integrity checksum over the placeholder form
        let checksum = crate::tools::sha1_hex(&body);
        let text = String::from_utf8(body)
            .map_err(|err| format_err!("manifest is not utf-8 - {}", err))?;
        let text = text.replacen(
            "backrest-checksum=\"\"",
            &format!("backrest-checksum=\"{}\"", checksum),
            1,
        );

        Ok(text.into_bytes())
    }

    /// Parse the on-disk text, verifying the integrity checksum.
    pub fn load(data: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(data)
            .map_err(|_| BackupError::Format("manifest is not utf-8".to_string()))?;

        // verify the checksum over the placeholder form
        let mut stored_checksum = None;
        let mut verify_text = String::with_capacity(text.len());
        for line in text.lines() {
            if stored_checksum.is_none() && line.starts_with("backrest-checksum=") {
                let value = &line["backrest-checksum=".len()..];
                let value: String = serde_json::from_str(value).map_err(|_| {
                    BackupError::Format("invalid manifest checksum value".to_string())
                })?;
                stored_checksum = Some(value);
                verify_text.push_str("backrest-checksum=\"\"\n");
            } else {
                verify_text.push_str(line);
                verify_text.push('\n');
            }
        }
        let stored_checksum = stored_checksum.ok_or_else(|| {
            BackupError::Checksum("manifest has no integrity checksum".to_string())
        })?;
        let actual = crate::tools::sha1_hex(verify_text.as_bytes());
        if actual != stored_checksum {
            return Err(BackupError::Checksum(format!(
                "manifest checksum mismatch (stored {}, actual {})",
                stored_checksum, actual
            ))
            .into());
        }

        let mut loader = Loader::default();
        let mut section = String::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_string();
                continue;
            }
            let eq = line.find('=').ok_or_else(|| {
                BackupError::Format(format!("manifest line without '=': '{}'", line))
            })?;
            let key = &line[..eq];
            let raw = &line[eq + 1..];
            loader.key(&section, key, raw)?;
        }

        loader.finish()
    }
}

struct FileDefaults {
    mode: String,
    user: String,
    group: String,
    master: bool,
}

struct PathDefaults {
    mode: String,
    user: String,
    group: String,
}

/// Accumulates parsed keys, then resolves defaults into entries.
#[derive(Default)]
struct Loader {
    version: Option<String>,
    backup: BTreeMap<String, Value>,
    db: BTreeMap<String, Value>,
    options: BTreeMap<String, Value>,
    targets: BTreeMap<String, Value>,
    files: BTreeMap<String, Value>,
    file_default: BTreeMap<String, Value>,
    links: BTreeMap<String, Value>,
    paths: BTreeMap<String, Value>,
    path_default: BTreeMap<String, Value>,
    unknown: BTreeMap<String, BTreeMap<String, String>>,
}

fn parse_value(section: &str, key: &str, raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|_| {
        BackupError::Format(format!(
            "invalid value for '{}' in section [{}]",
            key, section
        ))
        .into()
    })
}

impl Loader {
    fn key(&mut self, section: &str, key: &str, raw: &str) -> Result<(), Error> {
        let target_map = match section {
            "backrest" => {
                match key {
                    "backrest-checksum" => {} // verified separately
                    "backrest-format" => {
                        let value = parse_value(section, key, raw)?;
                        if value.as_u64() != Some(MANIFEST_FORMAT as u64) {
                            return Err(BackupError::Format(format!(
                                "unexpected manifest format {}",
                                value
                            ))
                            .into());
                        }
                    }
                    "backrest-version" => {
                        let value = parse_value(section, key, raw)?;
                        self.version = value.as_str().map(String::from);
                    }
                    _ => {
                        self.unknown
                            .entry(section.to_string())
                            .or_default()
                            .insert(key.to_string(), raw.to_string());
                    }
                }
                return Ok(());
            }
            "backup" => &mut self.backup,
            "backup:db" => &mut self.db,
            "backup:option" => &mut self.options,
            "backup:target" => &mut self.targets,
            "target:file" => &mut self.files,
            "target:file:default" => &mut self.file_default,
            "target:link" => &mut self.links,
            "target:path" => &mut self.paths,
            "target:path:default" => &mut self.path_default,
            _ => {
                self.unknown
                    .entry(section.to_string())
                    .or_default()
                    .insert(key.to_string(), raw.to_string());
                return Ok(());
            }
        };
        target_map.insert(key.to_string(), parse_value(section, key, raw)?);
        Ok(())
    }

    fn take_str(map: &mut BTreeMap<String, Value>, key: &str) -> Result<String, Error> {
        match map.remove(key) {
            Some(Value::String(s)) => Ok(s),
            _ => Err(BackupError::Format(format!("missing manifest key '{}'", key)).into()),
        }
    }

    fn take_opt_str(map: &mut BTreeMap<String, Value>, key: &str) -> Option<String> {
        match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn take_i64(map: &mut BTreeMap<String, Value>, key: &str) -> Result<i64, Error> {
        map.remove(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| BackupError::Format(format!("missing manifest key '{}'", key)).into())
    }

    fn take_u64(map: &mut BTreeMap<String, Value>, key: &str) -> Result<u64, Error> {
        map.remove(key)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| BackupError::Format(format!("missing manifest key '{}'", key)).into())
    }

    fn take_bool(map: &mut BTreeMap<String, Value>, key: &str) -> Result<bool, Error> {
        map.remove(key)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| BackupError::Format(format!("missing manifest key '{}'", key)).into())
    }

    fn stash_unknown(
        unknown: &mut BTreeMap<String, BTreeMap<String, String>>,
        section: &str,
        map: BTreeMap<String, Value>,
    ) {
        if map.is_empty() {
            return;
        }
        let entry = unknown.entry(section.to_string()).or_default();
        for (key, value) in map {
            entry.insert(key, value.to_string());
        }
    }

    fn finish(mut self) -> Result<Manifest, Error> {
        let backup = BackupHeader {
            label: Self::take_str(&mut self.backup, "backup-label")?,
            prior: Self::take_opt_str(&mut self.backup, "backup-prior"),
            backup_type: Self::take_str(&mut self.backup, "backup-type")?.parse()?,
            timestamp_start: Self::take_i64(&mut self.backup, "backup-timestamp-start")?,
            timestamp_copy_start: Self::take_i64(&mut self.backup, "backup-timestamp-copy-start")?,
            timestamp_stop: self
                .backup
                .remove("backup-timestamp-stop")
                .and_then(|v| v.as_i64()),
            lsn_start: Self::take_opt_str(&mut self.backup, "backup-lsn-start"),
            lsn_stop: Self::take_opt_str(&mut self.backup, "backup-lsn-stop"),
            wal_start: Self::take_opt_str(&mut self.backup, "backup-wal-start"),
            wal_stop: Self::take_opt_str(&mut self.backup, "backup-wal-stop"),
        };
        Self::stash_unknown(&mut self.unknown, "backup", self.backup.split_off(""));

        let version_str = Self::take_str(&mut self.db, "db-version")?;
        let version = {
            let mut parts = version_str.splitn(2, '.');
            let major: u32 = parts
                .next()
                .unwrap_or("")
                .parse()
                .map_err(|_| BackupError::Format(format!("bad db-version '{}'", version_str)))?;
            let minor: u32 = match parts.next() {
                Some(minor) => minor.parse().map_err(|_| {
                    BackupError::Format(format!("bad db-version '{}'", version_str))
                })?,
                None => 0,
            };
            major * 10000 + minor * 100
        };
        let db = DbInfo {
            version,
            system_id: Self::take_u64(&mut self.db, "db-system-id")?,
            control_version: Self::take_u64(&mut self.db, "db-control-version")? as u32,
            catalog_version: Self::take_u64(&mut self.db, "db-catalog-version")? as u32,
        };
        Self::stash_unknown(&mut self.unknown, "backup:db", self.db.split_off(""));

        let options = OptionHeader {
            online: Self::take_bool(&mut self.options, "option-online")?,
            compress_type: Self::take_str(&mut self.options, "option-compress-type")?.parse()?,
            compress_level: Self::take_u64(&mut self.options, "option-compress-level")? as u32,
            cipher_type: Self::take_str(&mut self.options, "option-cipher-type")?.parse()?,
            hardlink: Self::take_bool(&mut self.options, "option-hardlink")?,
            checksum_page: Self::take_bool(&mut self.options, "option-checksum-page")?,
            backup_standby: Self::take_bool(&mut self.options, "option-backup-standby")?,
            buffer_size: Self::take_u64(&mut self.options, "option-buffer-size")? as usize,
            process_max: Self::take_u64(&mut self.options, "option-process-max")? as usize,
            delta: Self::take_bool(&mut self.options, "option-delta")?,
            archive_check: Self::take_bool(&mut self.options, "option-archive-check")?,
            archive_copy: Self::take_bool(&mut self.options, "option-archive-copy")?,
        };
        Self::stash_unknown(&mut self.unknown, "backup:option", self.options.split_off(""));

        let mut manifest = Manifest {
            version: self.version.unwrap_or_default(),
            backup,
            options,
            db,
            targets: BTreeMap::new(),
            paths: BTreeMap::new(),
            files: BTreeMap::new(),
            links: BTreeMap::new(),
            unknown: self.unknown,
        };

        for (name, value) in self.targets {
            let mut map = match value {
                Value::Object(map) => map,
                _ => {
                    return Err(BackupError::Format(format!(
                        "target '{}' is not an object",
                        name
                    ))
                    .into())
                }
            };
            let kind = match map.remove("type").and_then(|v| v.as_str().map(String::from)) {
                Some(ref t) if t == "path" => TargetKind::Path,
                Some(ref t) if t == "link" => TargetKind::Link,
                _ => {
                    return Err(
                        BackupError::Format(format!("target '{}' has no type", name)).into()
                    )
                }
            };
            let path = map
                .remove("path")
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| BackupError::Format(format!("target '{}' has no path", name)))?;
            let tablespace_id = match map.remove("tablespace-id") {
                Some(Value::String(s)) => Some(s.parse().map_err(|_| {
                    BackupError::Format(format!("target '{}' has a bad tablespace id", name))
                })?),
                _ => None,
            };
            let tablespace_name = map
                .remove("tablespace-name")
                .and_then(|v| v.as_str().map(String::from));
            manifest.target_add(
                name,
                TargetEntry {
                    kind,
                    path,
                    tablespace_id,
                    tablespace_name,
                    extra: map,
                },
            );
        }

        let file_default = FileDefaults {
            mode: self
                .file_default
                .remove("mode")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "0640".to_string()),
            user: self
                .file_default
                .remove("user")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            group: self
                .file_default
                .remove("group")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            master: self
                .file_default
                .remove("master")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        };

        for (name, value) in self.files {
            let mut map = match value {
                Value::Object(map) => map,
                _ => {
                    return Err(
                        BackupError::Format(format!("file '{}' is not an object", name)).into()
                    )
                }
            };
            let size = map.remove("size").and_then(|v| v.as_u64()).ok_or_else(|| {
                BackupError::Format(format!("file '{}' has no size", name))
            })?;
            let timestamp = map
                .remove("timestamp")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    BackupError::Format(format!("file '{}' has no timestamp", name))
                })?;
            let entry = FileEntry {
                size,
                timestamp,
                repo_size: map.remove("repo-size").and_then(|v| v.as_u64()),
                checksum: map.remove("checksum").and_then(|v| v.as_str().map(String::from)),
                reference: map
                    .remove("reference")
                    .and_then(|v| v.as_str().map(String::from)),
                checksum_page: map.remove("checksum-page").and_then(|v| v.as_bool()),
                checksum_page_error: map.remove("checksum-page-error"),
                master: map
                    .remove("master")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(file_default.master),
                mode: map
                    .remove("mode")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| file_default.mode.clone()),
                user: map
                    .remove("user")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| file_default.user.clone()),
                group: map
                    .remove("group")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| file_default.group.clone()),
                extra: map,
            };
            manifest.file_add(name, entry);
        }

        for (name, value) in self.links {
            let mut map = match value {
                Value::Object(map) => map,
                _ => {
                    return Err(
                        BackupError::Format(format!("link '{}' is not an object", name)).into()
                    )
                }
            };
            let destination = map
                .remove("destination")
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| {
                    BackupError::Format(format!("link '{}' has no destination", name))
                })?;
            manifest.link_add(
                name,
                LinkEntry {
                    destination,
                    user: map
                        .remove("user")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default(),
                    group: map
                        .remove("group")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default(),
                    extra: map,
                },
            );
        }

        let path_default = PathDefaults {
            mode: self
                .path_default
                .remove("mode")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "0750".to_string()),
            user: self
                .path_default
                .remove("user")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            group: self
                .path_default
                .remove("group")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
        };

        for (name, value) in self.paths {
            let mut map = match value {
                Value::Object(map) => map,
                _ => {
                    return Err(
                        BackupError::Format(format!("path '{}' is not an object", name)).into()
                    )
                }
            };
            manifest.path_add(
                name,
                PathEntry {
                    mode: map
                        .remove("mode")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| path_default.mode.clone()),
                    user: map
                        .remove("user")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| path_default.user.clone()),
                    group: map
                        .remove("group")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| path_default.group.clone()),
                    extra: map,
                },
            );
        }

        // leftovers of the default sections are unknown keys too
        Self::stash_unknown(
            &mut manifest.unknown,
            "target:file:default",
            self.file_default,
        );
        Self::stash_unknown(
            &mut manifest.unknown,
            "target:path:default",
            self.path_default,
        );

        Ok(manifest)
    }
}

#[cfg(test)]
pub(crate) fn test_manifest(backup_type: BackupType, label: &str) -> Manifest {
    let mut manifest = Manifest::new(
        BackupHeader {
            label: label.to_string(),
            prior: None,
            backup_type,
            timestamp_start: 1570000000,
            timestamp_copy_start: 1570000002,
            timestamp_stop: None,
            lsn_start: None,
            lsn_stop: None,
            wal_start: None,
            wal_stop: None,
        },
        OptionHeader {
            online: true,
            compress_type: CompressType::None,
            compress_level: 0,
            cipher_type: CipherType::None,
            hardlink: false,
            checksum_page: false,
            backup_standby: false,
            buffer_size: 65536,
            process_max: 1,
            delta: false,
            archive_check: false,
            archive_copy: false,
        },
        DbInfo {
            version: pg::PG_VERSION_96,
            system_id: 6569239123849665679,
            control_version: 960,
            catalog_version: 201608131,
        },
    );
    manifest.target_add(
        TARGET_PGDATA.to_string(),
        TargetEntry {
            kind: TargetKind::Path,
            path: "/var/lib/pgsql/data".to_string(),
            tablespace_id: None,
            tablespace_name: None,
            extra: serde_json::Map::new(),
        },
    );
    manifest.path_add(
        TARGET_PGDATA.to_string(),
        PathEntry {
            mode: "0750".to_string(),
            user: "postgres".to_string(),
            group: "postgres".to_string(),
            extra: serde_json::Map::new(),
        },
    );
    manifest
}
