//! The backup controller.
//!
//! Top-level state machine driving one backup: reconcile options
//! against the cluster, start the backup protocol, build the manifest
//! from a cluster walk, dispatch the copy jobs, stop the protocol,
//! finalize the manifest, verify WAL archival and publish.
//!
//! Failure semantics: nothing touches the repository before the
//! backup directory is created; afterwards an interrupted run leaves a
//! resumable partial that the next run's resume analysis picks up.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use log::{info, warn};

use crate::config::{BackupOptions, BackupType, WorkerRole};
use crate::error::BackupError;
use crate::pg::{self, Lsn, PgClient, PgControl, StartBackupResult, TablespaceInfo};
use crate::protocol::{RemoteClient, RemoteClientPool};

use super::{
    can_verify_pages, label_full, label_type, manifest_build, relation_first_blkno, resume_apply,
    resume_check, run_jobs, unique_label, BackupHeader, BackupRepo, CopyContext, CopyParams,
    CopyStats, DbInfo, FileEntry, FileJob, JobExecutor, LocalExecutor, Manifest, OptionHeader,
    RepoFileWriter,
};

/// WAL archive lookup used by the final archive check. The archive
/// command itself is outside this crate.
pub trait WalArchive: Send {
    fn has_segment(&self, name: &str) -> Result<bool, Error>;
}

/// POSIX directory archive.
pub struct FsWalArchive {
    dir: PathBuf,
}

impl FsWalArchive {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

impl WalArchive for FsWalArchive {
    fn has_segment(&self, name: &str) -> Result<bool, Error> {
        for suffix in &["", ".gz", ".zst"] {
            if self.dir.join(format!("{}{}", name, suffix)).exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// What a finished backup reports back.
#[derive(Debug)]
pub struct BackupSummary {
    pub label: String,
    pub backup_type: BackupType,
    pub prior: Option<String>,
    pub resumed: bool,
    pub delta: bool,
    pub stats: CopyStats,
    pub lsn_start: Option<String>,
    pub lsn_stop: Option<String>,
}

pub struct BackupController {
    opts: BackupOptions,
    repo: BackupRepo,
    primary: Option<Box<dyn PgClient>>,
    standby: Option<Box<dyn PgClient>>,
    archive: Option<Box<dyn WalArchive>>,
    remotes: RemoteClientPool,
}

impl BackupController {
    /// `primary` is required for online backups; `standby` only with
    /// backup-standby; `archive` only with archive-check.
    pub fn new(
        opts: BackupOptions,
        primary: Option<Box<dyn PgClient>>,
        standby: Option<Box<dyn PgClient>>,
        archive: Option<Box<dyn WalArchive>>,
    ) -> Result<Self, Error> {
        let repo = BackupRepo::open(&opts.repo_path, &opts.stanza)?;
        Ok(Self {
            opts,
            repo,
            primary,
            standby,
            archive,
            remotes: RemoteClientPool::new(),
        })
    }

    pub fn run(mut self) -> Result<BackupSummary, Error> {
        let control = PgControl::read(&self.opts.pg_path)?;
        info!(
            "backup start: stanza {}, cluster {} (system id {})",
            self.opts.stanza,
            pg::version_to_str(control.version),
            control.system_id
        );

        self.reconcile_options(&control)?;

        // cache a control connection to the database host so long
        // local-only phases can keep the transport alive
        if let Some(host) = self.opts.pg_host.clone() {
            let argv = self.opts.to_argv(WorkerRole::Primary);
            let timeout = Duration::from_secs(self.opts.protocol_timeout);
            self.remotes
                .get_or_spawn(&host, "control", || spawn_remote(&host, &argv, timeout))?;
        }

        let (start, tablespaces) = if self.opts.online {
            self.connect(&control)?
        } else {
            self.check_offline()?;
            (None, Vec::new())
        };

        let result = self.run_backup(&control, start, tablespaces);
        if let Err(err) = &result {
            warn!("backup failed: {}", err);
        }
        result
    }

    /// Option reconciliation against cluster version and run mode.
    fn reconcile_options(&mut self, control: &PgControl) -> Result<(), Error> {
        if !self.opts.online {
            if self.opts.archive_check {
                warn!("archive-check is not supported offline, resetting");
                self.opts.archive_check = false;
            }
            if self.opts.archive_copy {
                warn!("archive-copy is not supported offline, resetting");
                self.opts.archive_copy = false;
            }
            if self.opts.backup_standby {
                warn!("backup-standby is not supported offline, resetting");
                self.opts.backup_standby = false;
            }
        }

        if self.opts.backup_standby && control.version < pg::PG_VERSION_BACKUP_STANDBY {
            bail!(
                "backup-standby requires PostgreSQL {} or better",
                pg::version_to_str(pg::PG_VERSION_BACKUP_STANDBY)
            );
        }

        if self.opts.online
            && control.version < pg::PG_VERSION_BACKUP_START_FAST
            && self.opts.start_fast
        {
            bail!(
                "start-fast is not supported before PostgreSQL {}",
                pg::version_to_str(pg::PG_VERSION_BACKUP_START_FAST)
            );
        }

        match self.opts.checksum_page {
            Some(true) if !control.page_checksum => {
                warn!("page checksums are not enabled on the cluster, resetting checksum-page");
                self.opts.checksum_page = Some(false);
            }
            None => self.opts.checksum_page = Some(control.page_checksum),
            _ => {}
        }

        Ok(())
    }

    /// Connect, verify identity, lock, start the backup.
    fn connect(
        &mut self,
        control: &PgControl,
    ) -> Result<(Option<StartBackupResult>, Vec<TablespaceInfo>), Error> {
        let primary = self
            .primary
            .as_mut()
            .ok_or_else(|| format_err!("online backup requires a database connection"))?;

        let version = primary.version()?;
        if version != control.version {
            return Err(BackupError::BackupMismatch(format!(
                "connected cluster is {} but the data directory is {}",
                pg::version_to_str(version),
                pg::version_to_str(control.version)
            ))
            .into());
        }
        if primary.is_standby()? {
            return Err(BackupError::BackupMismatch(
                "the primary connection points at a cluster in recovery".to_string(),
            )
            .into());
        }
        if !primary.advisory_lock()? {
            bail!("a backup is already running for this stanza");
        }

        if self.opts.backup_standby {
            let standby = self
                .standby
                .as_mut()
                .ok_or_else(|| format_err!("backup-standby requires a standby connection"))?;
            if !standby.is_standby()? {
                return Err(BackupError::BackupMismatch(
                    "the standby connection points at a primary".to_string(),
                )
                .into());
            }
        }

        let exclusive = control.version < pg::PG_VERSION_BACKUP_NON_EXCLUSIVE;
        let time = primary.time()?;
        let label_hint = format!("pgbackup {}", time);
        let start = primary.start_backup(&label_hint, self.opts.start_fast, exclusive)?;
        info!(
            "backup started at lsn {} (wal segment {})",
            start.lsn, start.wal_segment
        );

        let tablespaces = primary.tablespace_list()?;

        Ok((Some(start), tablespaces))
    }

    /// Offline mode: refuse to copy under a running postmaster.
    fn check_offline(&self) -> Result<(), Error> {
        let pid_file = self.opts.pg_path.join(pg::PG_FILE_POSTMASTERPID);
        if pid_file.exists() {
            if self.opts.force {
                warn!("postmaster.pid exists but --force was given, continuing");
            } else {
                return Err(BackupError::PostmasterRunning(format!(
                    "{} exists - stop the cluster or use --force",
                    pid_file.display()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Pick the effective type and the prior backup to base it on.
    fn select_type(&self) -> Result<(BackupType, Option<String>), Error> {
        let requested = self.opts.backup_type;
        if requested == BackupType::Full {
            return Ok((BackupType::Full, None));
        }

        let labels = self.repo.list_labels()?;
        let prior = match requested {
            BackupType::Diff => labels
                .iter()
                .rev()
                .find(|l| label_type(l).map(|t| t == BackupType::Full).unwrap_or(false)),
            BackupType::Incr => labels.last(),
            BackupType::Full => unreachable!(),
        };

        let prior = match prior {
            Some(prior) => prior.clone(),
            None => {
                warn!(
                    "no prior backup exists, {} backup has been changed to full",
                    requested
                );
                return Ok((BackupType::Full, None));
            }
        };

        Ok((requested, Some(prior)))
    }

    fn load_prior_manifest(
        &self,
        control: &PgControl,
        prior: &str,
    ) -> Result<Option<Manifest>, Error> {
        let manifest = match self.repo.load_manifest(&self.repo.backup_path(prior)) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    "prior backup {} is unusable ({}), downgrading to full",
                    prior, err
                );
                return Ok(None);
            }
        };
        if manifest.db.system_id != control.system_id || manifest.db.version != control.version {
            warn!(
                "prior backup {} was taken from a different cluster, downgrading to full",
                prior
            );
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    fn run_backup(
        &mut self,
        control: &PgControl,
        start: Option<StartBackupResult>,
        tablespaces: Vec<TablespaceInfo>,
    ) -> Result<BackupSummary, Error> {
        let checksum_page = self.opts.checksum_page.unwrap_or(false);

        // type selection with downgrade when the prior chain is unusable
        let (mut backup_type, mut prior) = self.select_type()?;
        let mut prior_manifest = None;
        if let Some(prior_label) = &prior {
            match self.load_prior_manifest(control, prior_label)? {
                Some(manifest) => prior_manifest = Some(manifest),
                None => {
                    backup_type = BackupType::Full;
                    prior = None;
                }
            }
        }

        let now = match self.primary.as_mut() {
            Some(client) if self.opts.online => client.time()?,
            _ => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_secs() as i64,
        };

        let prior_full = match (&prior, backup_type) {
            (Some(label), BackupType::Diff) | (Some(label), BackupType::Incr) => {
                Some(label_full(label)?)
            }
            _ => None,
        };
        let (label, label_time) = unique_label(
            backup_type,
            prior_full.as_deref(),
            now,
            &self.repo.list_labels()?,
        )?;

        let mut delta = self.opts.delta;

        let mut manifest = Manifest::new(
            BackupHeader {
                label: label.clone(),
                prior: prior.clone(),
                backup_type,
                timestamp_start: label_time,
                timestamp_copy_start: now,
                timestamp_stop: None,
                lsn_start: start.as_ref().map(|s| s.lsn.to_string()),
                lsn_stop: None,
                wal_start: start.as_ref().map(|s| s.wal_segment.clone()),
                wal_stop: None,
            },
            OptionHeader {
                online: self.opts.online,
                compress_type: self.opts.compress_type,
                compress_level: self.opts.compress_level,
                cipher_type: self.opts.cipher_type,
                hardlink: self.opts.hardlink,
                checksum_page,
                backup_standby: self.opts.backup_standby,
                buffer_size: self.opts.buffer_size,
                process_max: self.opts.process_max,
                delta,
                archive_check: self.opts.archive_check,
                archive_copy: self.opts.archive_copy,
            },
            DbInfo {
                version: control.version,
                system_id: control.system_id,
                control_version: control.control_version,
                catalog_version: control.catalog_version,
            },
        );

        let future_timestamps = manifest_build(
            &mut manifest,
            &self.opts.pg_path,
            control.version,
            &tablespaces,
            self.opts.archive_copy,
            &self.opts.exclude,
        )?;
        if future_timestamps && !delta {
            warn!("file timestamps in the future force checksum delta mode for this backup");
            delta = true;
        }

        // resume a matching partial, or clear it out of the way
        let mut resumable = std::collections::HashSet::new();
        let mut resumed = false;
        let mut backup_dir = self.repo.partial_path(&manifest.backup.label);
        if let Some((partial_label, partial_dir)) = self.repo.find_resumable()? {
            match self.repo.load_manifest(&partial_dir) {
                Ok(saved) => match resume_check(&manifest, &saved, self.opts.resume) {
                    None => {
                        info!("resuming partial backup {}", partial_label);
                        manifest.backup.label = saved.backup.label.clone();
                        backup_dir = partial_dir;
                        let outcome = resume_apply(&mut manifest, &saved, &backup_dir)?;
                        resumable = outcome.resumable;
                        if outcome.enable_delta && !delta {
                            warn!("resumed artifacts with changed timestamps force checksum delta mode");
                            delta = true;
                        }
                        resumed = true;
                    }
                    Some(reason) => {
                        info!(
                            "partial backup {} cannot be resumed ({}), removing it",
                            partial_label, reason
                        );
                        std::fs::remove_dir_all(&partial_dir)?;
                    }
                },
                Err(err) => {
                    info!(
                        "partial backup {} has no usable manifest ({}), removing it",
                        partial_label, err
                    );
                    std::fs::remove_dir_all(&partial_dir)?;
                }
            }
        }
        manifest.options.delta = delta;
        let label = manifest.backup.label.clone();

        std::fs::create_dir_all(&backup_dir)?;

        // with a standby, wait for it to replay past the start point
        if self.opts.backup_standby {
            let start = start
                .as_ref()
                .ok_or_else(|| format_err!("backup-standby requires an online backup"))?;
            self.wait_for_standby(start.lsn)?;
        }

        let ctx = CopyContext {
            backup_dir: backup_dir.clone(),
            compress_type: self.opts.compress_type,
            compress_level: self.opts.compress_level,
            cipher_type: self.opts.cipher_type,
            cipher_pass: self.opts.cipher_pass.clone(),
            delta,
            buffer_size: self.opts.buffer_size,
            page_size: control.page_size,
        };

        let jobs = self.build_jobs(
            &manifest,
            prior_manifest.as_ref(),
            &resumable,
            control,
            checksum_page,
            start.as_ref(),
            delta,
        )?;

        // apply references for unchanged files before dispatch
        if let (Some(prior_manifest), Some(prior_label)) = (&prior_manifest, &prior) {
            self.apply_references(&mut manifest, prior_manifest, prior_label, &jobs)?;
        }

        let executors = self.build_executors(&ctx)?;
        let stats = run_jobs(
            &mut manifest,
            &ctx,
            jobs,
            executors,
            &self.repo,
            &backup_dir,
            self.opts.manifest_save_threshold,
        )
        .map_err(|err| format_err!("backup {} failed: {}", label, err))?;

        // stop the backup and synthesize the label files
        let mut lsn_stop = None;
        if self.opts.online {
            let exclusive = control.version < pg::PG_VERSION_BACKUP_NON_EXCLUSIVE;
            let primary = self
                .primary
                .as_mut()
                .ok_or_else(|| format_err!("online backup lost its connection"))?;
            let stop = primary.stop_backup(exclusive)?;
            info!(
                "backup stopped at lsn {} (wal segment {})",
                stop.lsn, stop.wal_segment
            );
            manifest.backup.lsn_stop = Some(stop.lsn.to_string());
            manifest.backup.wal_stop = Some(stop.wal_segment.clone());
            manifest.backup.timestamp_stop = Some(stop.timestamp);
            lsn_stop = Some(stop.lsn);

            if let Some(contents) = &stop.backup_label {
                store_synthesized(
                    &ctx,
                    &mut manifest,
                    &format!("pg_data/{}", pg::PG_FILE_BACKUPLABEL),
                    contents.as_bytes(),
                    stop.timestamp,
                )?;
            }
            if let Some(contents) = &stop.tablespace_map {
                store_synthesized(
                    &ctx,
                    &mut manifest,
                    &format!("pg_data/{}", pg::PG_FILE_TABLESPACEMAP),
                    contents.as_bytes(),
                    stop.timestamp,
                )?;
            }

            if let Some(start) = &start {
                self.archive_check(control, start, lsn_stop.expect("stop lsn is set"))?;
            }
        } else {
            manifest.backup.timestamp_stop = Some(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_secs() as i64,
            );
        }

        // the manifest does not know which backups exist; resolving
        // references is on us
        let known = self.repo.list_labels()?;
        for (name, entry) in manifest.files() {
            if let Some(reference) = &entry.reference {
                if !known.iter().any(|l| l == reference) {
                    return Err(BackupError::Assert(format!(
                        "file '{}' references unknown backup '{}'",
                        name, reference
                    ))
                    .into());
                }
            }
        }

        self.repo.save_manifest(&backup_dir, &manifest)?;
        self.repo.publish(&label)?;

        info!(
            "backup {} complete: {} copied, {} referenced or unchanged, {} bytes in repository",
            label,
            stats.copied + stats.recopied,
            stats.noop + stats.checksum_match,
            stats.repo_bytes
        );

        Ok(BackupSummary {
            label,
            backup_type,
            prior,
            resumed,
            delta,
            stats,
            lsn_start: manifest.backup.lsn_start.clone(),
            lsn_stop: manifest.backup.lsn_stop.clone(),
        })
    }

    /// Build the copy job list from the manifest.
    #[allow(clippy::too_many_arguments)]
    fn build_jobs(
        &self,
        manifest: &Manifest,
        prior_manifest: Option<&Manifest>,
        resumable: &std::collections::HashSet<String>,
        control: &PgControl,
        checksum_page: bool,
        start: Option<&StartBackupResult>,
        delta: bool,
    ) -> Result<Vec<FileJob>, Error> {
        let mut jobs = Vec::new();

        for (name, entry) in manifest.files() {
            // unchanged against the prior backup and not in delta
            // mode: referenced without a copy job
            let prior_entry = prior_manifest.and_then(|m| m.file(name).ok());
            if let Some(prior_entry) = prior_entry {
                let unchanged = prior_entry.size == entry.size
                    && prior_entry.timestamp == entry.timestamp
                    && prior_entry.checksum.is_some();
                if unchanged && !delta {
                    continue; // reference applied separately
                }
            }

            let first_blkno = relation_first_blkno(name, control.page_size);
            let check_pages = can_verify_pages(checksum_page, first_blkno.is_some(), entry.size);

            let source_path = self.source_path(manifest, name, entry.master)?;
            let delta_checksum = if delta {
                prior_entry.and_then(|e| e.checksum.clone())
            } else {
                None
            };
            let has_reference = delta_checksum.is_some();
            let checksum = if resumable.contains(name) {
                entry.checksum.clone()
            } else {
                delta_checksum
            };

            jobs.push(FileJob {
                params: CopyParams {
                    manifest_name: name.clone(),
                    source_path,
                    ignore_missing: self.opts.online,
                    size: entry.size,
                    copy_exact_size: first_blkno.is_some(),
                    checksum,
                    has_reference,
                    check_pages,
                    page_lsn_limit: start.map(|s| s.lsn.0).unwrap_or(0),
                    first_blkno: first_blkno.unwrap_or(0),
                    resumable: resumable.contains(name),
                },
                role: if self.opts.backup_standby && !entry.master {
                    WorkerRole::Standby
                } else {
                    WorkerRole::Primary
                },
            });
        }

        Ok(jobs)
    }

    /// Reference every prior-backup file whose bytes will not land in
    /// this backup: files without a copy job (unchanged, non-delta),
    /// and delta jobs that may come back as no-ops. A job that does
    /// copy clears the reference again when its result is applied.
    fn apply_references(
        &self,
        manifest: &mut Manifest,
        prior_manifest: &Manifest,
        prior_label: &str,
        jobs: &[FileJob],
    ) -> Result<(), Error> {
        let copying: std::collections::HashSet<&str> = jobs
            .iter()
            .filter(|j| !j.params.has_reference)
            .map(|j| j.params.manifest_name.as_str())
            .collect();

        let names: Vec<String> = manifest.files().map(|(name, _)| name.clone()).collect();
        for name in names {
            if copying.contains(name.as_str()) {
                continue;
            }
            let prior_entry = match prior_manifest.file(&name) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            // bytes live where the prior backup put them
            let reference = prior_entry
                .reference
                .clone()
                .unwrap_or_else(|| prior_label.to_string());
            let checksum = prior_entry.checksum.clone();
            let page = prior_entry.checksum_page;
            let page_error = prior_entry.checksum_page_error.clone();
            manifest.set_reference(&name, &reference)?;
            let entry = manifest.file_mut(&name)?;
            entry.checksum = checksum;
            entry.checksum_page = page;
            entry.checksum_page_error = page_error;
        }
        Ok(())
    }

    /// Absolute source path for a manifest name, on the host the file
    /// will be read from.
    fn source_path(
        &self,
        manifest: &Manifest,
        name: &str,
        master: bool,
    ) -> Result<PathBuf, Error> {
        let (target_name, relative) = manifest
            .targets()
            .find_map(|(target_name, _)| {
                if let Some(rest) = name.strip_prefix(&format!("{}/", target_name)) {
                    Some((target_name.clone(), rest.to_string()))
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                BackupError::Assert(format!("'{}' does not belong to any target", name))
            })?;

        let target = manifest.target(&target_name)?;

        // standby reads come from the standby's own data directory
        if self.opts.backup_standby && !master && target_name == super::TARGET_PGDATA {
            if let Some(standby_path) = &self.opts.standby_pg_path {
                return Ok(standby_path.join(relative));
            }
        }

        Ok(Path::new(&target.path).join(relative))
    }

    /// Worker pool layout: all workers on the primary role unless the
    /// standby serves the bulk of the reads, then one primary worker
    /// is kept for master-only files.
    fn build_executors(
        &mut self,
        ctx: &CopyContext,
    ) -> Result<Vec<(WorkerRole, Box<dyn JobExecutor>)>, Error> {
        let process_max = self.opts.process_max.max(1);
        let mut layout = Vec::new();
        if self.opts.backup_standby {
            layout.push(WorkerRole::Primary);
            for _ in 0..process_max.max(2) - 1 {
                layout.push(WorkerRole::Standby);
            }
        } else {
            for _ in 0..process_max {
                layout.push(WorkerRole::Primary);
            }
        }

        let mut executors: Vec<(WorkerRole, Box<dyn JobExecutor>)> = Vec::new();
        for role in layout {
            let executor: Box<dyn JobExecutor> = match &self.opts.pg_host {
                Some(host) => {
                    let argv = self.opts.to_argv(role);
                    let timeout = Duration::from_secs(self.opts.protocol_timeout);
                    let client = spawn_remote(host, &argv, timeout)?;
                    Box::new(client)
                }
                None => Box::new(LocalExecutor::new(ctx)?),
            };
            executors.push((role, executor));
        }
        Ok(executors)
    }

    fn wait_for_standby(&mut self, start_lsn: Lsn) -> Result<(), Error> {
        let standby = self
            .standby
            .as_mut()
            .ok_or_else(|| format_err!("backup-standby requires a standby connection"))?;
        let deadline = Instant::now() + Duration::from_secs(self.opts.archive_timeout);
        loop {
            let replayed = standby.replay_lsn()?;
            if replayed >= start_lsn {
                info!("standby replayed past {} at {}", start_lsn, replayed);
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "standby did not replay past {} within {} seconds",
                    start_lsn,
                    self.opts.archive_timeout
                );
            }
            std::thread::sleep(Duration::from_millis(100));
            self.remotes.keepalive();
        }
    }

    /// Wait for every WAL segment the backup spans to reach the
    /// archive.
    fn archive_check(
        &mut self,
        control: &PgControl,
        start: &StartBackupResult,
        stop_lsn: Lsn,
    ) -> Result<(), Error> {
        if !self.opts.archive_check {
            return Ok(());
        }
        let archive = match &self.archive {
            Some(archive) => archive,
            None => {
                warn!("archive-check is enabled but no archive is configured");
                return Ok(());
            }
        };

        let segments = pg::wal_segment_range(
            start.timeline,
            start.lsn,
            stop_lsn,
            control.wal_segment_size,
        )?;
        let deadline = Instant::now() + Duration::from_secs(self.opts.archive_timeout);

        for segment in &segments {
            loop {
                if archive.has_segment(segment)? {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(BackupError::ArchiveTimeout(format!(
                        "wal segment {} did not reach the archive within {} seconds",
                        segment, self.opts.archive_timeout
                    ))
                    .into());
                }
                std::thread::sleep(Duration::from_millis(100));
                self.remotes.keepalive();
            }
        }
        info!("all {} wal segments are archived", segments.len());
        Ok(())
    }
}

/// Spawn a remote worker over the subprocess transport.
fn spawn_remote(host: &str, argv: &[String], timeout: Duration) -> Result<RemoteClient, Error> {
    let mut args = vec![host.to_string(), "pgbackup-remote".to_string()];
    args.extend(argv.iter().cloned());
    RemoteClient::spawn("ssh", &args, timeout)
}

/// Write a synthesized file (backup_label, tablespace_map) through the
/// regular repository pipeline and record it in the manifest.
fn store_synthesized(
    ctx: &CopyContext,
    manifest: &mut Manifest,
    name: &str,
    contents: &[u8],
    timestamp: i64,
) -> Result<(), Error> {
    use std::io::Write;

    let crypt = ctx.crypt_config()?;
    let repo_path = ctx
        .backup_dir
        .join(format!("{}{}", name, ctx.compress_type.extension()));
    if let Some(parent) = repo_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = std::fs::File::create(&repo_path)?;
    let mut writer = RepoFileWriter::new(out, ctx.compress_type, ctx.compress_level, crypt.as_ref())?;
    writer.write_all(contents)?;
    let (_, repo_size) = writer.finish()?;

    manifest.file_add(
        name.to_string(),
        FileEntry {
            size: contents.len() as u64,
            repo_size: Some(repo_size),
            timestamp,
            checksum: Some(crate::tools::sha1_hex(contents)),
            reference: None,
            checksum_page: None,
            checksum_page_error: None,
            master: true,
            mode: "0600".to_string(),
            user: crate::tools::current_user_name()?,
            group: crate::tools::current_group_name()?,
            extra: serde_json::Map::new(),
        },
    );
    Ok(())
}
