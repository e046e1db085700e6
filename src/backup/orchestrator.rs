//! Parallel dispatch of file copy jobs.
//!
//! A fixed pool of workers, each bound to a source role and owning its
//! executor (in-process copy or a remote protocol connection). Jobs
//! are queued FIFO in an order chosen for locality; results are
//! applied to the manifest single-threaded in completion order. The
//! in-progress manifest copy is persisted every time enough bytes have
//! been copied, which is what a later resume builds on.
//!
//! Cancellation is cooperative: a failing worker poisons a shared
//! abort slot and every worker checks it between files.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};

use crate::config::WorkerRole;

use super::{
    backup_file, BackupRepo, CopyContext, CopyParams, CopyResult, CopyResultKind, CryptConfig,
    Manifest,
};

/// One file copy job, bound to the role its source is read from.
pub struct FileJob {
    pub params: CopyParams,
    pub role: WorkerRole,
}

/// The executor seam: in-process for local storage, a protocol client
/// for remote storage. Same contract either way.
pub trait JobExecutor: Send {
    fn backup_file(&mut self, ctx: &CopyContext, params: &CopyParams)
        -> Result<CopyResult, Error>;
}

/// In-process executor. Derives the crypt config once.
pub struct LocalExecutor {
    crypt: Option<CryptConfig>,
}

impl LocalExecutor {
    pub fn new(ctx: &CopyContext) -> Result<Self, Error> {
        Ok(Self {
            crypt: ctx.crypt_config()?,
        })
    }
}

impl JobExecutor for LocalExecutor {
    fn backup_file(
        &mut self,
        ctx: &CopyContext,
        params: &CopyParams,
    ) -> Result<CopyResult, Error> {
        backup_file(ctx, self.crypt.as_ref(), params)
    }
}

impl JobExecutor for crate::protocol::RemoteClient {
    fn backup_file(
        &mut self,
        ctx: &CopyContext,
        params: &CopyParams,
    ) -> Result<CopyResult, Error> {
        crate::protocol::RemoteClient::backup_file(self, ctx, params)
    }
}

/// Per-kind result counters plus byte totals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub copied: usize,
    pub skipped: usize,
    pub noop: usize,
    pub recopied: usize,
    pub checksum_match: usize,
    pub copy_bytes: u64,
    pub repo_bytes: u64,
}

impl CopyStats {
    fn count(&mut self, result: &CopyResult) {
        match result.kind {
            CopyResultKind::Copied => self.copied += 1,
            CopyResultKind::Skipped => self.skipped += 1,
            CopyResultKind::NoOp => self.noop += 1,
            CopyResultKind::ReCopied => self.recopied += 1,
            CopyResultKind::ChecksumMatch => self.checksum_match += 1,
        }
        self.copy_bytes += result.copy_size;
        self.repo_bytes += result.repo_size;
    }
}

/// Order jobs for dispatch: grouped by containing directory, largest
/// first within the group, so workers stay in one directory while big
/// files level the end of the run.
pub fn order_jobs(jobs: &mut Vec<FileJob>) {
    jobs.sort_by(|a, b| {
        let dir_a = a.params.manifest_name.rsplitn(2, '/').nth(1).unwrap_or("");
        let dir_b = b.params.manifest_name.rsplitn(2, '/').nth(1).unwrap_or("");
        dir_a
            .cmp(dir_b)
            .then(b.params.size.cmp(&a.params.size))
            .then(a.params.manifest_name.cmp(&b.params.manifest_name))
    });
}

fn set_abort(abort: &Mutex<Option<String>>, message: String) {
    let mut guard = abort.lock().unwrap();
    if guard.is_none() {
        *guard = Some(message);
    }
}

fn abort_set(abort: &Mutex<Option<String>>) -> bool {
    abort.lock().unwrap().is_some()
}

/// Apply one completed job to the manifest.
fn apply_result(
    manifest: &mut Manifest,
    params: &CopyParams,
    result: &CopyResult,
) -> Result<(), Error> {
    let name = &params.manifest_name;

    if result.kind == CopyResultKind::Skipped {
        info!("skip vanished file {}", name);
        manifest.file_remove(name);
        return Ok(());
    }

    let entry = manifest.file_mut(name)?;
    entry.size = result.copy_size;
    entry.checksum = result.checksum.clone();

    match result.kind {
        CopyResultKind::NoOp => {
            entry.repo_size = Some(0);
            if !params.has_reference {
                entry.reference = None;
            }
        }
        _ => {
            entry.repo_size = Some(result.repo_size);
            entry.reference = None;
        }
    }

    if let Some(page_result) = &result.page_result {
        entry.checksum_page = Some(page_result.valid);
        entry.checksum_page_error = page_result.error.clone();
        if page_result.misaligned {
            warn!("{} is not page aligned, page validation skipped", name);
        } else if !page_result.valid {
            warn!(
                "invalid page checksums in {}: {}",
                name,
                entry
                    .checksum_page_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

/// Run all jobs to completion, updating the manifest as results come
/// in and persisting progress at `save_threshold` byte intervals.
///
/// `executors` defines the pool: one worker thread per entry, bound to
/// the entry's role.
pub fn run_jobs(
    manifest: &mut Manifest,
    ctx: &CopyContext,
    mut jobs: Vec<FileJob>,
    executors: Vec<(WorkerRole, Box<dyn JobExecutor>)>,
    repo: &BackupRepo,
    backup_dir: &Path,
    save_threshold: u64,
) -> Result<CopyStats, Error> {
    if executors.is_empty() {
        return Err(format_err!("orchestrator needs at least one worker"));
    }

    order_jobs(&mut jobs);
    let total = jobs.len();

    let (primary_tx, primary_rx) = unbounded::<FileJob>();
    let (standby_tx, standby_rx) = unbounded::<FileJob>();
    let (result_tx, result_rx) = unbounded::<(CopyParams, Result<CopyResult, Error>)>();

    for job in jobs {
        let queue = match job.role {
            WorkerRole::Primary => &primary_tx,
            WorkerRole::Standby => &standby_tx,
        };
        queue
            .send(job)
            .map_err(|_| format_err!("job queue closed before dispatch"))?;
    }
    drop(primary_tx);
    drop(standby_tx);

    let abort = Arc::new(Mutex::new(None::<String>));
    let mut handles = Vec::new();

    for (index, (role, mut executor)) in executors.into_iter().enumerate() {
        let job_rx: Receiver<FileJob> = match role {
            WorkerRole::Primary => primary_rx.clone(),
            WorkerRole::Standby => standby_rx.clone(),
        };
        let result_tx: Sender<(CopyParams, Result<CopyResult, Error>)> = result_tx.clone();
        let abort = Arc::clone(&abort);
        let ctx = ctx.clone();

        handles.push(
            std::thread::Builder::new()
                .name(format!("backup worker ({})", index))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        // cooperative cancel, checked at file boundaries
                        if abort_set(&abort) {
                            return;
                        }
                        let result = executor.backup_file(&ctx, &job.params);
                        let failed = result.is_err();
                        if result_tx.send((job.params, result)).is_err() {
                            return;
                        }
                        if failed {
                            return;
                        }
                    }
                })
                .map_err(|err| format_err!("unable to spawn worker - {}", err))?,
        );
    }
    drop(result_tx);
    drop(primary_rx);
    drop(standby_rx);

    let mut stats = CopyStats::default();
    let mut first_error: Option<Error> = None;
    let mut bytes_since_save = 0u64;
    let mut done = 0usize;

    while let Ok((params, result)) = result_rx.recv() {
        match result {
            Ok(result) => {
                stats.count(&result);
                bytes_since_save += result.copy_size;
                done += 1;
                if let Err(err) = apply_result(manifest, &params, &result) {
                    set_abort(&abort, err.to_string());
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }
                if save_threshold > 0 && bytes_since_save >= save_threshold {
                    bytes_since_save = 0;
                    if let Err(err) = repo.save_manifest_copy(backup_dir, manifest) {
                        warn!("unable to persist manifest progress: {}", err);
                    }
                }
            }
            Err(err) => {
                set_abort(
                    &abort,
                    format!("copy of '{}' failed", params.manifest_name),
                );
                let err =
                    format_err!("copy of '{}' failed: {}", params.manifest_name, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            let err = format_err!("backup worker panicked");
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    if done != total {
        return Err(format_err!(
            "orchestrator finished {} of {} jobs without an error",
            done,
            total
        ));
    }

    Ok(stats)
}
