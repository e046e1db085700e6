//! The backup core.
//!
//! # Repository layout
//!
//! Each stanza owns a subtree `<repo>/<stanza>/backup/` holding one
//! directory per backup, named by its label. A backup directory
//! contains the manifest (`backup.manifest` plus a verbatim
//! `backup.manifest.copy` for torn-write recovery) and a mirrored tree
//! of the cluster: `pg_data/...` for the data directory and
//! `pg_tblspc/<oid>/...` for each tablespace, every file suffixed with
//! the active compression extension.
//!
//! A backup is built inside `<label>.partial` and renamed to its final
//! name at publish time; the `latest` symlink swap afterwards is the
//! atomic publish boundary. Anything found under a partial name (or a
//! final name the `latest` pointer does not cover) is a candidate for
//! resume.
//!
//! # Manifest
//!
//! The manifest is the authoritative record of a backup: every path,
//! file and link with its attributes and checksum, the tablespace
//! targets, the cluster identity, and the options the backup was taken
//! under. Non-full backups reference unchanged files in a prior backup
//! instead of storing them again.
//!
//! # Concurrency
//!
//! One controller drives the database protocol and owns the manifest.
//! File copies fan out over a fixed pool of workers, each single
//! threaded with blocking I/O, possibly on a remote host behind the
//! line protocol. Results are applied to the manifest in completion
//! order; the in-progress manifest copy is persisted whenever enough
//! bytes have been copied since the last save, which is what makes an
//! interrupted backup resumable.

mod label;
pub use label::*;

mod manifest;
pub use manifest::*;

mod cluster;
pub use cluster::*;

mod page_verify;
pub use page_verify::*;

mod checksum_reader;
pub use checksum_reader::*;

mod crypt_config;
pub use crypt_config::*;

mod crypt_writer;
pub use crypt_writer::*;

mod repo_file;
pub use repo_file::*;

mod file_copy;
pub use file_copy::*;

mod resume;
pub use resume::*;

mod repo;
pub use repo::*;

mod orchestrator;
pub use orchestrator::*;

mod controller;
pub use controller::*;
