//! Manifest construction from a cluster walk.
//!
//! Enumerates the data directory and every tablespace, skipping
//! transient state the server rebuilds itself, and records each
//! surviving path, file and link with its stat attributes.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;
use walkdir::WalkDir;

use crate::pg::{self, TablespaceInfo};
use crate::tools;

use super::{
    FileEntry, LinkEntry, Manifest, PathEntry, TargetEntry, TargetKind, TARGET_PGDATA,
    TARGET_PGTBLSPC,
};

/// Files never worth copying: the server recreates them.
const SKIP_FILES: &[&str] = &["postmaster.pid", "postmaster.opts", "pg_internal.init"];

/// Directories whose contents are transient; the directory itself is
/// kept so a restore recreates it.
const SKIP_DIR_CONTENTS: &[&str] = &["pg_stat_tmp", "pg_notify", "pg_snapshots", "pg_serial"];

/// Temp sort/rewrite spill areas.
const SKIP_PREFIX: &str = "pgsql_tmp";

lazy_static! {
    static ref RELATION_FILE_REGEX: Regex = Regex::new(r"^(\d+)(?:\.(\d+))?$").unwrap();
}

/// Segment size of a relation in bytes; segment N of a relation
/// starts at page N * (RELATION_SEGMENT_SIZE / page_size).
const RELATION_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

/// First page ordinal of a relation file eligible for page
/// verification, or `None` when the file is not a relation main fork.
pub fn relation_first_blkno(manifest_name: &str, page_size: u32) -> Option<u32> {
    let in_relation_dir = manifest_name.starts_with("pg_data/base/")
        || manifest_name.starts_with("pg_data/global/")
        || manifest_name.starts_with("pg_tblspc/");
    if !in_relation_dir {
        return None;
    }
    let file_name = manifest_name.rsplit('/').next()?;
    let captures = RELATION_FILE_REGEX.captures(file_name)?;
    let segment: u64 = captures
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    let pages_per_segment = RELATION_SEGMENT_SIZE / page_size as u64;
    Some((segment * pages_per_segment) as u32)
}

/// Whether a file must be read from the primary. Replicated relation
/// data is identical on a caught-up standby; configuration and the
/// control file are not.
pub fn file_is_master(manifest_name: &str) -> bool {
    if manifest_name == "pg_data/global/pg_control" {
        return true;
    }
    !(manifest_name.starts_with("pg_data/base/")
        || manifest_name.starts_with("pg_data/global/")
        || manifest_name.starts_with("pg_tblspc/"))
}

struct WalkContext<'a> {
    wal_dir: String,
    archive_copy: bool,
    exclude: &'a [String],
}

impl WalkContext<'_> {
    /// Decide whether a target-relative name is walked at all.
    fn keep(&self, relative: &str, is_dir: bool) -> bool {
        let parts: Vec<&str> = relative.split('/').collect();
        let file_name = parts.last().copied().unwrap_or(relative);

        if !is_dir && SKIP_FILES.contains(&file_name) {
            return false;
        }
        for part in &parts {
            if part.starts_with(SKIP_PREFIX) {
                return false;
            }
        }
        // everything below a transient directory goes, the directory
        // itself stays
        for part in &parts[..parts.len() - 1] {
            if SKIP_DIR_CONTENTS.contains(part) {
                return false;
            }
        }
        if parts.len() > 1 && parts[0] == self.wal_dir {
            // archived-state bookkeeping never travels, segments only
            // when archive-copy asks for them
            if !self.archive_copy || parts[1] == "archive_status" {
                return false;
            }
        }
        for exclude in self.exclude {
            if relative == exclude || relative.starts_with(&format!("{}/", exclude)) {
                return false;
            }
        }
        true
    }
}

fn walk_target(
    manifest: &mut Manifest,
    target_name: &str,
    base: &Path,
    ctx: &WalkContext,
    max_timestamp: &mut i64,
) -> Result<(), Error> {
    for entry in WalkDir::new(base).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| format_err!("cluster walk failed - {}", err))?;
        let relative = entry
            .path()
            .strip_prefix(base)
            .map_err(|err| format_err!("cluster walk escaped its base - {}", err))?;
        let relative = relative.to_string_lossy().to_string();

        let name = if relative.is_empty() {
            target_name.to_string()
        } else {
            if !ctx.keep(&relative, entry.file_type().is_dir()) {
                continue;
            }
            format!("{}/{}", target_name, relative)
        };

        let metadata = entry
            .path()
            .symlink_metadata()
            .map_err(|err| format_err!("stat '{}' failed - {}", entry.path().display(), err))?;
        let mode = format!("{:04o}", metadata.permissions().mode() & 0o7777);
        let user = tools::user_name_from_uid(metadata.uid());
        let group = tools::group_name_from_gid(metadata.gid());

        if entry.file_type().is_dir() {
            manifest.path_add(
                name,
                PathEntry {
                    mode,
                    user,
                    group,
                    extra: serde_json::Map::new(),
                },
            );
        } else if entry.file_type().is_symlink() {
            let destination = std::fs::read_link(entry.path())
                .map_err(|err| format_err!("readlink '{}' failed - {}", name, err))?;
            manifest.link_add(
                name,
                LinkEntry {
                    destination: destination.to_string_lossy().to_string(),
                    user,
                    group,
                    extra: serde_json::Map::new(),
                },
            );
        } else if entry.file_type().is_file() {
            let timestamp = metadata.mtime();
            if timestamp > *max_timestamp {
                *max_timestamp = timestamp;
            }
            let master = file_is_master(&name);
            manifest.file_add(
                name,
                FileEntry {
                    size: metadata.len(),
                    repo_size: None,
                    timestamp,
                    checksum: None,
                    reference: None,
                    checksum_page: None,
                    checksum_page_error: None,
                    master,
                    mode,
                    user,
                    group,
                    extra: serde_json::Map::new(),
                },
            );
        }
        // sockets and other special files are never backed up
    }
    Ok(())
}

/// Walk the cluster into `manifest`. Returns true when any file's
/// timestamp lies in the future relative to copy start, which forces
/// delta mode for the whole backup.
pub fn manifest_build(
    manifest: &mut Manifest,
    pg_path: &Path,
    version: u32,
    tablespaces: &[TablespaceInfo],
    archive_copy: bool,
    exclude: &[String],
) -> Result<bool, Error> {
    let ctx = WalkContext {
        wal_dir: pg::wal_path(version).to_string(),
        archive_copy,
        exclude,
    };

    manifest.target_add(
        TARGET_PGDATA.to_string(),
        TargetEntry {
            kind: TargetKind::Path,
            path: pg_path.to_string_lossy().to_string(),
            tablespace_id: None,
            tablespace_name: None,
            extra: serde_json::Map::new(),
        },
    );

    let mut max_timestamp = 0i64;
    walk_target(manifest, TARGET_PGDATA, pg_path, &ctx, &mut max_timestamp)?;

    for tablespace in tablespaces {
        let target_name = format!("{}/{}", TARGET_PGTBLSPC, tablespace.oid);
        manifest.target_add(
            target_name.clone(),
            TargetEntry {
                kind: TargetKind::Link,
                path: tablespace.path.to_string_lossy().to_string(),
                tablespace_id: Some(tablespace.oid),
                tablespace_name: Some(tablespace.name.clone()),
                extra: serde_json::Map::new(),
            },
        );
        walk_target(
            manifest,
            &target_name,
            &tablespace.path,
            &ctx,
            &mut max_timestamp,
        )?;
    }

    Ok(max_timestamp > manifest.backup.timestamp_copy_start)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::test_manifest;
    use crate::config::BackupType;

    fn testdir(name: &str) -> std::path::PathBuf {
        let mut path = std::fs::canonicalize(".").unwrap();
        path.push(format!(".testdir-cluster-{}", name));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_walk_records_and_skips() -> Result<(), Error> {
        let dir = testdir("walk");
        std::fs::create_dir_all(dir.join("global"))?;
        std::fs::create_dir_all(dir.join("pg_xlog"))?;
        std::fs::create_dir_all(dir.join("pg_stat_tmp"))?;
        std::fs::write(dir.join("PG_VERSION"), b"9.6\n")?;
        std::fs::write(dir.join("postgresql.conf"), b"CONFIGSTUFF")?;
        std::fs::write(dir.join("postmaster.pid"), b"123")?;
        std::fs::write(dir.join("global/pg_control"), vec![0u8; 8192])?;
        std::fs::write(dir.join("pg_xlog/000000010000000000000001"), b"wal")?;
        std::fs::create_dir_all(dir.join("pg_xlog/archive_status"))?;
        std::fs::write(
            dir.join("pg_xlog/archive_status/000000010000000000000001.ready"),
            b"",
        )?;
        std::fs::write(dir.join("pg_stat_tmp/global.stat"), b"stats")?;

        let mut manifest = test_manifest(BackupType::Full, "20191002-070640F");
        let future =
            manifest_build(&mut manifest, &dir, pg::PG_VERSION_96, &[], false, &[])?;

        assert!(manifest.file_exists("pg_data/PG_VERSION"));
        assert!(manifest.file_exists("pg_data/postgresql.conf"));
        assert!(manifest.file_exists("pg_data/global/pg_control"));
        assert!(!manifest.file_exists("pg_data/postmaster.pid"));
        assert!(!manifest.file_exists("pg_data/pg_xlog/000000010000000000000001"));
        assert!(!manifest.path_exists("pg_data/pg_xlog/archive_status"));
        assert!(!manifest
            .file_exists("pg_data/pg_xlog/archive_status/000000010000000000000001.ready"));
        assert!(!manifest.file_exists("pg_data/pg_stat_tmp/global.stat"));
        // skipped contents keep their directories
        assert!(manifest.path_exists("pg_data/pg_xlog"));
        assert!(manifest.path_exists("pg_data/pg_stat_tmp"));

        // walked attributes are concrete
        let file = manifest.file("pg_data/postgresql.conf")?;
        assert_eq!(file.size, 11);
        assert!(file.master);
        assert!(!manifest.file("pg_data/PG_VERSION")?.timestamp.is_negative());

        // timestamps were just written, copy-start is 2019: flagged
        assert!(future);

        manifest.save()?;

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_wal_kept_with_archive_copy() -> Result<(), Error> {
        let dir = testdir("walcopy");
        std::fs::create_dir_all(dir.join("pg_xlog"))?;
        std::fs::write(dir.join("pg_xlog/000000010000000000000001"), b"wal")?;

        let mut manifest = test_manifest(BackupType::Full, "20191002-070640F");
        manifest_build(&mut manifest, &dir, pg::PG_VERSION_96, &[], true, &[])?;
        assert!(manifest.file_exists("pg_data/pg_xlog/000000010000000000000001"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_relation_first_blkno() {
        assert_eq!(relation_first_blkno("pg_data/base/1/16384", 8192), Some(0));
        assert_eq!(
            relation_first_blkno("pg_data/base/1/16384.2", 8192),
            Some(2 * 131072)
        );
        assert_eq!(relation_first_blkno("pg_tblspc/16387/PG_9.6_201608131/16390/2613", 8192), Some(0));
        assert_eq!(relation_first_blkno("pg_data/base/1/16384_fsm", 8192), None);
        assert_eq!(relation_first_blkno("pg_data/PG_VERSION", 8192), None);
        assert_eq!(relation_first_blkno("pg_data/postgresql.conf", 8192), None);
    }

    #[test]
    fn test_file_is_master() {
        assert!(file_is_master("pg_data/postgresql.conf"));
        assert!(file_is_master("pg_data/global/pg_control"));
        assert!(!file_is_master("pg_data/global/1262"));
        assert!(!file_is_master("pg_data/base/1/16384"));
        assert!(!file_is_master("pg_tblspc/16387/PG_9.6_201608131/16390/2613"));
    }
}
