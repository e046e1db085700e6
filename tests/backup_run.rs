use std::path::{Path, PathBuf};

use anyhow::Error;
use serde_json::json;

use pgbackup::backup::*;
use pgbackup::config::{BackupOptions, BackupType, CipherType, CompressType};
use pgbackup::pg::{PgControl, ScriptedPgClient, PG_VERSION_84, PG_VERSION_95};
use pgbackup::tools;

fn testdir(name: &str) -> PathBuf {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(format!(".testdir-run-{}", name));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn write_cluster_file(pg_path: &Path, name: &str, data: &[u8]) {
    let path = pg_path.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn base_options(dir: &Path, backup_type: BackupType) -> BackupOptions {
    let mut opts = BackupOptions::default();
    opts.stanza = "main".to_string();
    opts.pg_path = dir.join("pgdata");
    opts.repo_path = dir.join("repo");
    opts.backup_type = backup_type;
    opts.compress_type = CompressType::None;
    opts.compress_level = 0;
    opts.cipher_type = CipherType::None;
    opts.archive_check = false;
    opts.process_max = 2;
    opts
}

const SYSTEM_ID: u64 = 6569239123849665679;

fn seed_control(pg_path: &Path, version: u32) {
    let control = PgControl::encode(version, SYSTEM_ID, 8192, 16 * 1024 * 1024, false);
    write_cluster_file(pg_path, "global/pg_control", &control);
}

fn script_online_95(time: i64) -> ScriptedPgClient {
    ScriptedPgClient::new(vec![
        ("version".to_string(), json!(90500)),
        ("is-standby".to_string(), json!(false)),
        ("advisory-lock".to_string(), json!(true)),
        ("time".to_string(), json!(time)),
        (
            // 9.5 still uses the exclusive protocol
            format!("start-backup label=pgbackup {} fast=false exclusive=true", time),
            json!({"lsn": "0/4000028", "wal-segment": "000000010000000000000004", "timeline": 1}),
        ),
        ("tablespace-list".to_string(), json!([])),
        ("time".to_string(), json!(time)),
        (
            "stop-backup exclusive=true".to_string(),
            json!({"lsn": "0/5000010", "wal-segment": "000000010000000000000005", "timestamp": time + 10}),
        ),
    ])
}

fn wall_clock() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn file_entry_from_fs(pg_path: &Path, relative: &str, data: &[u8]) -> FileEntry {
    let metadata = std::fs::metadata(pg_path.join(relative)).unwrap();
    use std::os::unix::fs::MetadataExt;
    FileEntry {
        size: metadata.len(),
        repo_size: Some(metadata.len()),
        timestamp: metadata.mtime(),
        checksum: Some(tools::sha1_hex(data)),
        reference: None,
        checksum_page: None,
        checksum_page_error: None,
        master: true,
        mode: "0640".to_string(),
        user: "postgres".to_string(),
        group: "postgres".to_string(),
        extra: serde_json::Map::new(),
    }
}

fn manifest_for_cluster(
    label: &str,
    backup_type: BackupType,
    pg_path: &Path,
    version: u32,
    control_version: u32,
    catalog_version: u32,
) -> Manifest {
    let mut manifest = Manifest::new(
        BackupHeader {
            label: label.to_string(),
            prior: None,
            backup_type,
            timestamp_start: 1569990000,
            timestamp_copy_start: 1569990000,
            timestamp_stop: Some(1569990010),
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
            buffer_size: 1024 * 1024,
            process_max: 2,
            delta: false,
            archive_check: false,
            archive_copy: false,
        },
        DbInfo {
            version,
            system_id: SYSTEM_ID,
            control_version,
            catalog_version,
        },
    );
    manifest.target_add(
        "pg_data".to_string(),
        TargetEntry {
            kind: TargetKind::Path,
            path: pg_path.to_string_lossy().to_string(),
            tablespace_id: None,
            tablespace_name: None,
            extra: serde_json::Map::new(),
        },
    );
    for path in &["pg_data", "pg_data/global"] {
        manifest.path_add(
            path.to_string(),
            PathEntry {
                mode: "0750".to_string(),
                user: "postgres".to_string(),
                group: "postgres".to_string(),
                extra: serde_json::Map::new(),
            },
        );
    }
    manifest
}

#[test]
fn test_offline_full_backup() -> Result<(), Error> {
    let dir = testdir("offline-full");
    let pg_path = dir.join("pgdata");
    seed_control(&pg_path, PG_VERSION_84);
    write_cluster_file(&pg_path, "postgresql.conf", b"CONFIGSTUFF");

    let mut opts = base_options(&dir, BackupType::Full);
    opts.online = false;

    let controller = BackupController::new(opts, None, None, None)?;
    let summary = controller.run()?;

    assert_eq!(summary.backup_type, BackupType::Full);
    assert_eq!(summary.stats.copied, 2);
    assert_eq!(summary.stats.copy_bytes, 11 + 8192);

    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    assert_eq!(repo.latest().as_deref(), Some(summary.label.as_str()));

    let manifest = repo.load_manifest(&repo.backup_path(&summary.label))?;
    assert_eq!(manifest.file_count(), 2);

    let conf = manifest.file("pg_data/postgresql.conf")?;
    assert_eq!(conf.size, 11);
    assert_eq!(
        conf.checksum.as_deref(),
        Some("e3db315c260e79211b7b52587123b7aa060f30ab")
    );
    let control = manifest.file("pg_data/global/pg_control")?;
    assert_eq!(control.size, 8192);

    // the repository mirrors the cluster exactly
    let backup_dir = repo.backup_path(&summary.label);
    assert_eq!(
        std::fs::read(backup_dir.join("pg_data/postgresql.conf"))?,
        b"CONFIGSTUFF"
    );
    assert_eq!(
        std::fs::read(backup_dir.join("pg_data/global/pg_control"))?,
        std::fs::read(pg_path.join("global/pg_control"))?
    );

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_offline_backup_refused_with_postmaster() -> Result<(), Error> {
    let dir = testdir("offline-refused");
    let pg_path = dir.join("pgdata");
    seed_control(&pg_path, PG_VERSION_84);
    write_cluster_file(&pg_path, "postmaster.pid", b"4242");

    let mut opts = base_options(&dir, BackupType::Full);
    opts.online = false;

    let controller = BackupController::new(opts.clone(), None, None, None)?;
    let err = controller.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<pgbackup::error::BackupError>(),
        Some(pgbackup::error::BackupError::PostmasterRunning(_))
    ));

    // --force overrides the refusal
    opts.force = true;
    let controller = BackupController::new(opts, None, None, None)?;
    let summary = controller.run()?;
    assert_eq!(summary.stats.copied, 2);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_online_full_with_resume() -> Result<(), Error> {
    let dir = testdir("resume");
    let pg_path = dir.join("pgdata");
    seed_control(&pg_path, PG_VERSION_95);
    write_cluster_file(&pg_path, "PG_VERSION", b"9.5\n");
    write_cluster_file(&pg_path, "postgresql.conf", b"CONFIGSTUFF");

    // seed the partial a prior interrupted run would have left
    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    let partial_label = "20191002-070540F";
    let partial_dir = repo.partial_path(partial_label);
    std::fs::create_dir_all(partial_dir.join("pg_data"))?;
    std::fs::copy(
        pg_path.join("PG_VERSION"),
        partial_dir.join("pg_data/PG_VERSION"),
    )?;

    let mut saved = manifest_for_cluster(
        partial_label,
        BackupType::Full,
        &pg_path,
        PG_VERSION_95,
        942,
        201510051,
    );
    saved.file_add(
        "pg_data/PG_VERSION".to_string(),
        file_entry_from_fs(&pg_path, "PG_VERSION", b"9.5\n"),
    );
    repo.save_manifest(&partial_dir, &saved)?;

    let opts = base_options(&dir, BackupType::Full);
    let client = script_online_95(1570000000);

    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let summary = controller.run()?;

    // the partial's label was adopted
    assert_eq!(summary.label, partial_label);
    assert!(summary.resumed);
    assert_eq!(summary.stats.checksum_match, 1);
    assert_eq!(summary.stats.copied, 2);

    let manifest = repo.load_manifest(&repo.backup_path(partial_label))?;
    assert_eq!(
        manifest.file("pg_data/PG_VERSION")?.checksum.as_deref(),
        Some(tools::sha1_hex(b"9.5\n").as_str())
    );

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_online_diff_references_prior() -> Result<(), Error> {
    let dir = testdir("diff");
    let pg_path = dir.join("pgdata");
    seed_control(&pg_path, PG_VERSION_95);
    write_cluster_file(&pg_path, "PG_VERSION", b"9.5\n");
    write_cluster_file(&pg_path, "postgresql.conf", b"CONFIGSTUFF");

    // publish a prior full covering the current cluster state
    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    let prior_label = "20191001-070640F";
    let prior_dir = repo.backup_path(prior_label);
    std::fs::create_dir_all(&prior_dir)?;

    let control_data = std::fs::read(pg_path.join("global/pg_control"))?;
    let mut prior = manifest_for_cluster(
        prior_label,
        BackupType::Full,
        &pg_path,
        PG_VERSION_95,
        942,
        201510051,
    );
    prior.file_add(
        "pg_data/PG_VERSION".to_string(),
        file_entry_from_fs(&pg_path, "PG_VERSION", b"9.5\n"),
    );
    prior.file_add(
        "pg_data/postgresql.conf".to_string(),
        file_entry_from_fs(&pg_path, "postgresql.conf", b"CONFIGSTUFF"),
    );
    prior.file_add(
        "pg_data/global/pg_control".to_string(),
        file_entry_from_fs(&pg_path, "global/pg_control", &control_data),
    );
    repo.save_manifest(&prior_dir, &prior)?;
    repo.publish(prior_label)?;

    // one new file since the full
    write_cluster_file(&pg_path, "pg_hba.conf", b"host all all samenet trust\n");

    // the scripted clock must not lag the file mtimes, or the future
    // timestamp heuristic would force delta mode
    let opts = base_options(&dir, BackupType::Diff);
    let client = script_online_95(wall_clock());
    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let summary = controller.run()?;

    assert_eq!(summary.backup_type, BackupType::Diff);
    assert_eq!(summary.prior.as_deref(), Some(prior_label));
    assert_eq!(summary.stats.copied, 1);
    assert_eq!(summary.stats.copy_bytes, 27);

    let manifest = repo.load_manifest(&repo.backup_path(&summary.label))?;
    for name in &[
        "pg_data/PG_VERSION",
        "pg_data/postgresql.conf",
        "pg_data/global/pg_control",
    ] {
        let entry = manifest.file(name)?;
        assert_eq!(entry.reference.as_deref(), Some(prior_label), "{}", name);
        assert_eq!(entry.repo_size, Some(0), "{}", name);
    }
    let new_entry = manifest.file("pg_data/pg_hba.conf")?;
    assert!(new_entry.reference.is_none());
    assert_eq!(new_entry.size, 27);

    // only the new file landed in the repository
    let backup_dir = repo.backup_path(&summary.label);
    assert!(backup_dir.join("pg_data/pg_hba.conf").exists());
    assert!(!backup_dir.join("pg_data/PG_VERSION").exists());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_delta_second_run_copies_nothing() -> Result<(), Error> {
    let dir = testdir("delta-idempotent");
    let pg_path = dir.join("pgdata");
    seed_control(&pg_path, PG_VERSION_95);
    write_cluster_file(&pg_path, "PG_VERSION", b"9.5\n");
    write_cluster_file(&pg_path, "postgresql.conf", b"CONFIGSTUFF");

    let opts = base_options(&dir, BackupType::Full);
    let client = script_online_95(1570000000);
    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let first = controller.run()?;
    assert_eq!(first.stats.copied, 3);

    // unchanged cluster, incremental with delta: no copies at all
    let mut opts = base_options(&dir, BackupType::Incr);
    opts.delta = true;
    let client = ScriptedPgClient::new(vec![
        ("version", json!(90500)),
        ("is-standby", json!(false)),
        ("advisory-lock", json!(true)),
        ("time", json!(1570003600)),
        (
            "start-backup label=pgbackup 1570003600 fast=false exclusive=true",
            json!({"lsn": "0/6000028", "wal-segment": "000000010000000000000006", "timeline": 1}),
        ),
        ("tablespace-list", json!([])),
        ("time", json!(1570003600)),
        (
            "stop-backup exclusive=true",
            json!({"lsn": "0/7000010", "wal-segment": "000000010000000000000007", "timestamp": 1570003610}),
        ),
    ]);
    // the first run consumed its own script; build a fresh controller
    let controller = BackupController::new(opts, Some(Box::new(client)), None, None)?;
    let second = controller.run()?;

    assert_eq!(second.backup_type, BackupType::Incr);
    assert_eq!(second.stats.copied, 0);
    assert_eq!(second.stats.recopied, 0);
    assert_eq!(second.stats.noop, 3);

    let repo = BackupRepo::open(&dir.join("repo"), "main")?;
    let manifest = repo.load_manifest(&repo.backup_path(&second.label))?;
    for (name, entry) in manifest.files() {
        assert_eq!(
            entry.reference.as_deref(),
            Some(first.label.as_str()),
            "{}",
            name
        );
    }

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
