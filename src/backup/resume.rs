//! Resume analysis.
//!
//! Decides whether a partial backup left by an interrupted run can be
//! completed, and classifies every artifact in its directory as
//! reusable, recopyable or garbage. Garbage is removed on the spot;
//! directories are always regenerated rather than reasoned about.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{format_err, Error};
use log::{info, warn};
use walkdir::WalkDir;

use crate::config::CompressType;

use super::{Manifest, MANIFEST_COPY_NAME, MANIFEST_NAME};

/// Why a partial backup cannot be resumed.
pub fn resume_check(plan: &Manifest, saved: &Manifest, resume_enabled: bool) -> Option<String> {
    if !resume_enabled {
        return Some("resume is disabled".to_string());
    }
    if saved.version != plan.version {
        return Some(format!(
            "partial was written by version {}, this is {}",
            saved.version, plan.version
        ));
    }
    if saved.backup.backup_type != plan.backup.backup_type {
        return Some(format!(
            "backup type changed from {} to {}",
            saved.backup.backup_type, plan.backup.backup_type
        ));
    }
    if saved.backup.prior != plan.backup.prior {
        return Some(format!(
            "prior backup changed from {:?} to {:?}",
            saved.backup.prior, plan.backup.prior
        ));
    }
    if saved.options.compress_type != plan.options.compress_type {
        return Some(format!(
            "compression changed from {} to {}",
            saved.options.compress_type.as_str(),
            plan.options.compress_type.as_str()
        ));
    }
    if saved.options.cipher_type != plan.options.cipher_type {
        return Some(format!(
            "cipher changed from {} to {}",
            saved.options.cipher_type.as_str(),
            plan.options.cipher_type.as_str()
        ));
    }
    None
}

/// Outcome of artifact classification.
pub struct ResumeApply {
    /// Manifest names whose artifact survived; the copy worker will
    /// verify and accept or recopy them.
    pub resumable: HashSet<String>,
    /// A timestamp mismatch was observed; the whole backup runs in
    /// delta mode.
    pub enable_delta: bool,
    pub removed: usize,
}

/// Map a repository file name back to its manifest name, checking the
/// compression extension matches the plan.
fn manifest_name_for(relative: &str, compress_type: CompressType) -> Option<String> {
    let known_exts: &[&str] = &[".gz", ".zst"];
    let ext = compress_type.extension();
    if ext.is_empty() {
        if known_exts.iter().any(|e| relative.ends_with(e)) {
            return None;
        }
        Some(relative.to_string())
    } else if let Some(stripped) = relative.strip_suffix(ext) {
        Some(stripped.to_string())
    } else {
        None
    }
}

/// Classify every artifact below `backup_dir` against the plan and the
/// saved manifest of the partial, removing anything not worth keeping.
pub fn resume_apply(
    plan: &mut Manifest,
    saved: &Manifest,
    backup_dir: &Path,
) -> Result<ResumeApply, Error> {
    let mut resumable = HashSet::new();
    let mut enable_delta = false;
    let mut removed = 0usize;

    // files first, directories afterwards (bottom up)
    for entry in WalkDir::new(backup_dir).contents_first(true) {
        let entry = entry.map_err(|err| format_err!("repository scan failed - {}", err))?;
        if entry.path() == backup_dir {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(backup_dir)
            .map_err(|err| format_err!("repository scan escaped its base - {}", err))?
            .to_string_lossy()
            .to_string();

        if relative == MANIFEST_NAME || relative == MANIFEST_COPY_NAME {
            continue;
        }

        if entry.file_type().is_dir() {
            if !plan.path_exists(&relative) {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
            continue;
        }

        if !entry.file_type().is_file() {
            // special files have no business in a repository
            warn!("removing special file '{}' from partial backup", relative);
            std::fs::remove_file(entry.path())?;
            removed += 1;
            continue;
        }

        let keep = classify_file(plan, saved, &relative, &mut enable_delta);
        match keep {
            Some(name) => {
                let checksum = saved
                    .file(&name)
                    .expect("classified file is in the saved manifest")
                    .checksum
                    .clone();
                plan.file_mut(&name)?.checksum = checksum;
                resumable.insert(name);
            }
            None => {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }

    info!(
        "resume classification kept {} artifacts, removed {}",
        resumable.len(),
        removed
    );

    Ok(ResumeApply {
        resumable,
        enable_delta,
        removed,
    })
}

/// One artifact's verdict; `Some(manifest name)` keeps it.
fn classify_file(
    plan: &Manifest,
    saved: &Manifest,
    relative: &str,
    enable_delta: &mut bool,
) -> Option<String> {
    let name = manifest_name_for(relative, plan.options.compress_type)?;

    let saved_entry = match saved.file(&name) {
        Ok(entry) => entry,
        Err(_) => return None, // stale garbage from an aborted run
    };

    // bytes live in a prior backup, nothing to resume
    if saved_entry.reference.is_some() {
        return None;
    }

    // never completed
    let checksum = saved_entry.checksum.as_ref()?;
    if checksum.is_empty() {
        return None;
    }

    let plan_entry = match plan.file(&name) {
        Ok(entry) => entry,
        Err(_) => return None, // no longer in the cluster
    };

    if plan_entry.size != saved_entry.size {
        return None;
    }

    if plan_entry.timestamp != saved_entry.timestamp {
        *enable_delta = true;
        return None;
    }

    // zero-size artifacts are cheaper to remake than to verify
    if plan_entry.size == 0 {
        return None;
    }

    Some(name)
}
