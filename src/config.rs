//! Typed backup options.
//!
//! The option parser lives outside this crate; it hands us a fully
//! typed [`BackupOptions`]. Remote worker command lines are synthesized
//! from the same struct via [`BackupOptions::to_argv`], so there is no
//! string-keyed option map anywhere.

use std::path::PathBuf;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Backup type. Full stands alone, differential references the last
/// full, incremental references the latest backup of any type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => bail!("invalid backup type '{}'", s),
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Repository compression applied to copied files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    None,
    Gz,
    Zst,
}

impl CompressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressType::None => "none",
            CompressType::Gz => "gz",
            CompressType::Zst => "zst",
        }
    }

    /// File name extension appended to repository files, including the
    /// leading dot, or an empty string for no compression.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressType::None => "",
            CompressType::Gz => ".gz",
            CompressType::Zst => ".zst",
        }
    }
}

impl std::str::FromStr for CompressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(CompressType::None),
            "gz" => Ok(CompressType::Gz),
            "zst" => Ok(CompressType::Zst),
            _ => bail!("invalid compress type '{}'", s),
        }
    }
}

/// Repository encryption applied after compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherType {
    None,
    Aes256Cbc,
}

impl CipherType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherType::None => "none",
            CipherType::Aes256Cbc => "aes-256-cbc",
        }
    }
}

impl std::str::FromStr for CipherType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(CipherType::None),
            "aes-256-cbc" => Ok(CipherType::Aes256Cbc),
            _ => bail!("invalid cipher type '{}'", s),
        }
    }
}

/// Role a spawned worker process takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    /// Runs on the database host, reads the primary's files.
    Primary,
    /// Runs on the standby host.
    Standby,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Primary => "primary",
            WorkerRole::Standby => "standby",
        }
    }
}

/// All settings the backup core consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Stanza name scoping labels and the repository subtree.
    pub stanza: String,
    /// Cluster data directory on the database host.
    pub pg_path: PathBuf,
    /// Database host to reach over the subprocess transport; `None`
    /// runs the copy workers in-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_host: Option<String>,
    /// Data directory of the standby used with backup-standby.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standby_pg_path: Option<PathBuf>,
    /// Repository root (the stanza subtree is created below it).
    pub repo_path: PathBuf,

    pub backup_type: BackupType,
    pub online: bool,
    /// Allow offline backup while a postmaster appears to be running.
    pub force: bool,
    pub delta: bool,
    pub resume: bool,
    pub hardlink: bool,

    pub archive_check: bool,
    pub archive_copy: bool,
    /// Seconds to wait for WAL segments to reach the archive.
    pub archive_timeout: u64,
    /// Seconds a single subprocess round-trip may take.
    pub protocol_timeout: u64,

    pub backup_standby: bool,
    /// Page checksum validation; `None` follows the cluster setting.
    pub checksum_page: Option<bool>,
    /// Issue an immediate checkpoint at backup start.
    pub start_fast: bool,

    pub compress_type: CompressType,
    pub compress_level: u32,
    pub cipher_type: CipherType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_pass: Option<String>,

    pub buffer_size: usize,
    pub process_max: usize,
    /// Bytes copied between saves of the in-progress manifest.
    pub manifest_save_threshold: u64,

    /// Extra relative paths excluded from the cluster walk.
    pub exclude: Vec<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            stanza: String::new(),
            pg_path: PathBuf::new(),
            pg_host: None,
            standby_pg_path: None,
            repo_path: PathBuf::new(),
            backup_type: BackupType::Incr,
            online: true,
            force: false,
            delta: false,
            resume: true,
            hardlink: false,
            archive_check: true,
            archive_copy: false,
            archive_timeout: 60,
            protocol_timeout: 1830,
            backup_standby: false,
            checksum_page: None,
            start_fast: false,
            compress_type: CompressType::Gz,
            compress_level: 6,
            cipher_type: CipherType::None,
            cipher_pass: None,
            buffer_size: 1024 * 1024,
            process_max: 1,
            manifest_save_threshold: 1024 * 1024 * 1024,
            exclude: Vec::new(),
        }
    }
}

impl BackupOptions {
    /// Command line for a remote worker process. Only keys the worker
    /// actually consumes are enumerated here; adding an option means
    /// extending this method, not editing a string map.
    pub fn to_argv(&self, role: WorkerRole) -> Vec<String> {
        let mut argv = vec![
            format!("--stanza={}", self.stanza),
            format!("--role={}", role.as_str()),
            format!("--pg-path={}", self.pg_path.display()),
            format!("--repo-path={}", self.repo_path.display()),
            format!("--compress-type={}", self.compress_type.as_str()),
            format!("--compress-level={}", self.compress_level),
            format!("--buffer-size={}", self.buffer_size),
            format!("--protocol-timeout={}", self.protocol_timeout),
        ];
        if self.cipher_type != CipherType::None {
            argv.push(format!("--cipher-type={}", self.cipher_type.as_str()));
        }
        if self.delta {
            argv.push("--delta".to_string());
        }
        argv
    }
}
