use std::path::{Path, PathBuf};

use anyhow::Error;
use serde_json::json;

use pgbackup::backup::{BackupController, BackupRepo};
use pgbackup::config::{BackupOptions, BackupType, CipherType, CompressType};
use pgbackup::pg::{self, PgControl, ScriptedPgClient, PG_VERSION_11};

const PAGE_SIZE: usize = 8192;

fn testdir(name: &str) -> PathBuf {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(format!(".testdir-page-{}", name));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn write_cluster_file(pg_path: &Path, name: &str, data: &[u8]) {
    let path = pg_path.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn valid_page(blkno: u32, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; PAGE_SIZE];
    page[0..8].copy_from_slice(&[0u8; 8]);
    // pd_upper past the header
    page[pg::PAGE_HEADER_UPPER_OFFSET] = 0x20;
    page[pg::PAGE_HEADER_UPPER_OFFSET + 1] = 0x00;
    pg::page_set_checksum(&mut page, blkno);
    page
}

fn broken_page(fill: u8) -> Vec<u8> {
    let mut page = vec![fill; PAGE_SIZE];
    page[0..8].copy_from_slice(&[0u8; 8]);
    page[pg::PAGE_HEADER_UPPER_OFFSET] = 0xFF;
    page[pg::PAGE_HEADER_UPPER_OFFSET + 1] = 0x00;
    // the stored checksum stays stale
    page
}

#[test]
fn test_online_11_page_checksums() -> Result<(), Error> {
    let dir = testdir("v11");
    let pg_path = dir.join("pgdata");

    let control = PgControl::encode(
        PG_VERSION_11,
        6569239123849665679,
        PAGE_SIZE as u32,
        16 * 1024 * 1024,
        true,
    );
    write_cluster_file(&pg_path, "global/pg_control", &control);
    write_cluster_file(&pg_path, "PG_VERSION", b"11\n");

    // one broken page
    write_cluster_file(&pg_path, "base/1/16384", &broken_page(0x11));

    // four pages: 0 broken, 1 valid, 2 and 3 broken
    let mut relation = Vec::new();
    relation.extend_from_slice(&broken_page(0x21));
    relation.extend_from_slice(&valid_page(1, 0x22));
    relation.extend_from_slice(&broken_page(0x23));
    relation.extend_from_slice(&broken_page(0x24));
    write_cluster_file(&pg_path, "base/1/16385", &relation);

    let mut opts = BackupOptions::default();
    opts.stanza = "main".to_string();
    opts.pg_path = pg_path.clone();
    opts.repo_path = dir.join("repo");
    opts.backup_type = BackupType::Full;
    opts.compress_type = CompressType::None;
    opts.cipher_type = CipherType::None;
    opts.archive_check = false;
    opts.process_max = 2;

    let client = ScriptedPgClient::new(vec![
        ("version", json!(110000)),
        ("is-standby", json!(false)),
        ("advisory-lock", json!(true)),
        ("time", json!(1570000000)),
        (
            "start-backup label=pgbackup 1570000000 fast=false exclusive=false",
            json!({"lsn": "0/4000028", "wal-segment": "000000010000000000000004", "timeline": 1}),
        ),
        ("tablespace-list", json!([])),
        ("time", json!(1570000000)),
        (
            "stop-backup exclusive=false",
            json!({
                "lsn": "0/5000010",
                "wal-segment": "000000010000000000000005",
                "timestamp": 1570000010,
                "backup-label": "START WAL LOCATION: 0/4000028\n",
            }),
        ),
    ]);

    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let summary = controller.run()?;

    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    let manifest = repo.load_manifest(&repo.backup_path(&summary.label))?;

    let single = manifest.file("pg_data/base/1/16384")?;
    assert_eq!(single.checksum_page, Some(false));
    assert_eq!(single.checksum_page_error, Some(json!([0])));

    let multi = manifest.file("pg_data/base/1/16385")?;
    assert_eq!(multi.checksum_page, Some(false));
    assert_eq!(multi.checksum_page_error, Some(json!([0, [2, 3]])));

    // non-relation files are not page validated
    assert_eq!(manifest.file("pg_data/PG_VERSION")?.checksum_page, None);

    // the non-exclusive stop synthesized the backup label
    let label_file = manifest.file("pg_data/backup_label")?;
    assert_eq!(label_file.size, "START WAL LOCATION: 0/4000028\n".len() as u64);
    assert!(repo
        .backup_path(&summary.label)
        .join("pg_data/backup_label")
        .exists());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_misaligned_relation_file() -> Result<(), Error> {
    let dir = testdir("misaligned");
    let pg_path = dir.join("pgdata");

    let control = PgControl::encode(
        PG_VERSION_11,
        6569239123849665679,
        PAGE_SIZE as u32,
        16 * 1024 * 1024,
        true,
    );
    write_cluster_file(&pg_path, "global/pg_control", &control);

    // a valid page plus a torn tail
    let mut relation = valid_page(0, 0x31);
    relation.extend_from_slice(&[0u8; 100]);
    write_cluster_file(&pg_path, "base/1/16384", &relation);

    let mut opts = BackupOptions::default();
    opts.stanza = "main".to_string();
    opts.pg_path = pg_path.clone();
    opts.repo_path = dir.join("repo");
    opts.backup_type = BackupType::Full;
    opts.compress_type = CompressType::None;
    opts.cipher_type = CipherType::None;
    opts.archive_check = false;

    let client = ScriptedPgClient::new(vec![
        ("version", json!(110000)),
        ("is-standby", json!(false)),
        ("advisory-lock", json!(true)),
        ("time", json!(1570000000)),
        (
            "start-backup label=pgbackup 1570000000 fast=false exclusive=false",
            json!({"lsn": "0/4000028", "wal-segment": "000000010000000000000004", "timeline": 1}),
        ),
        ("tablespace-list", json!([])),
        ("time", json!(1570000000)),
        (
            "stop-backup exclusive=false",
            json!({
                "lsn": "0/5000010",
                "wal-segment": "000000010000000000000005",
                "timestamp": 1570000010,
            }),
        ),
    ]);

    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let summary = controller.run()?;

    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    let manifest = repo.load_manifest(&repo.backup_path(&summary.label))?;

    // misaligned: flagged invalid, but no page list and no error
    let entry = manifest.file("pg_data/base/1/16384")?;
    assert_eq!(entry.checksum_page, Some(false));
    assert_eq!(entry.checksum_page_error, None);
    assert_eq!(entry.size, (PAGE_SIZE + 100) as u64);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
