//! Repository layout and bookkeeping for one stanza.
//!
//! Backups live under `<repo>/<stanza>/backup/<label>/`. A backup is
//! written into `<label>.partial` and renamed at publish; the `latest`
//! symlink swap is the atomic publish boundary.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use log::warn;

use crate::error::BackupError;
use crate::tools;

use super::{is_backup_label, Manifest, MANIFEST_COPY_NAME, MANIFEST_NAME};

/// Suffix of in-progress backup directories.
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Name of the publish pointer.
pub const LATEST_LINK: &str = "latest";

/// Manifests record cluster layout, paths and owners; readable for
/// owner and group, nothing for the world.
const MANIFEST_FILE_MODE: u32 = 0o640;

pub struct BackupRepo {
    /// `<repo>/<stanza>/backup`
    base: PathBuf,
}

impl BackupRepo {
    pub fn open(repo_path: &Path, stanza: &str) -> Result<Self, Error> {
        if stanza.is_empty() {
            bail!("stanza name must not be empty");
        }
        let base = repo_path.join(stanza).join("backup");
        std::fs::create_dir_all(&base)
            .map_err(|err| format_err!("unable to create repository at {:?} - {}", base, err))?;
        Ok(Self { base })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Final directory of a published (or publishable) backup.
    pub fn backup_path(&self, label: &str) -> PathBuf {
        self.base.join(label)
    }

    /// In-progress directory of a backup.
    pub fn partial_path(&self, label: &str) -> PathBuf {
        self.base.join(format!("{}{}", label, PARTIAL_SUFFIX))
    }

    /// All published backup labels, sorted; sort order is creation
    /// order by construction of the labels.
    pub fn list_labels(&self) -> Result<Vec<String>, Error> {
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_backup_label(&name) {
                labels.push(name);
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Label the `latest` pointer names, if it exists.
    pub fn latest(&self) -> Option<String> {
        let link = self.base.join(LATEST_LINK);
        std::fs::read_link(link)
            .ok()
            .map(|target| target.to_string_lossy().to_string())
    }

    /// Locate a partial backup worth offering to the resume analyzer:
    /// the newest unpublished backup directory.
    pub fn find_resumable(&self) -> Result<Option<(String, PathBuf)>, Error> {
        let latest = self.latest();
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(label) = name.strip_suffix(PARTIAL_SUFFIX) {
                if is_backup_label(label) {
                    candidates.push((label.to_string(), entry.path()));
                }
            } else if is_backup_label(&name) && latest.as_deref() < Some(name.as_str()) {
                // finalized but never published
                candidates.push((name.clone(), entry.path()));
            }
        }
        candidates.sort();
        Ok(candidates.pop())
    }

    /// Write both manifest files into a backup directory.
    pub fn save_manifest(&self, dir: &Path, manifest: &Manifest) -> Result<(), Error> {
        let data = manifest.save()?;
        tools::atomic_write_file(dir.join(MANIFEST_NAME), &data, MANIFEST_FILE_MODE)?;
        tools::atomic_write_file(dir.join(MANIFEST_COPY_NAME), &data, MANIFEST_FILE_MODE)?;
        Ok(())
    }

    /// Persist only the copy file; used for mid-backup progress so a
    /// later run can resume. The primary is written once at finalize.
    pub fn save_manifest_copy(&self, dir: &Path, manifest: &Manifest) -> Result<(), Error> {
        let data = manifest.save()?;
        tools::atomic_write_file(dir.join(MANIFEST_COPY_NAME), &data, MANIFEST_FILE_MODE)?;
        Ok(())
    }

    /// Load a manifest, falling back from the primary to the copy on
    /// integrity failure. Fails only when both are unusable.
    pub fn load_manifest(&self, dir: &Path) -> Result<Manifest, Error> {
        let primary = dir.join(MANIFEST_NAME);
        let primary_err = match tools::file_get_contents(&primary) {
            Ok(data) => match Manifest::load(&data) {
                Ok(manifest) => return Ok(manifest),
                Err(err) => err,
            },
            Err(err) => BackupError::FileMissing(format!("{} - {}", primary.display(), err)).into(),
        };

        warn!(
            "unable to load {} ({}), trying the copy",
            primary.display(),
            primary_err
        );

        let copy = dir.join(MANIFEST_COPY_NAME);
        match tools::file_get_contents(&copy) {
            Ok(data) => Manifest::load(&data).map_err(|err| {
                format_err!(
                    "both manifest files are unusable: {}; copy: {}",
                    primary_err,
                    err
                )
            }),
            Err(err) => Err(format_err!(
                "both manifest files are unusable: {}; copy: {}",
                primary_err,
                err
            )),
        }
    }

    /// Atomic publish: rename the partial directory to its final label
    /// and swap the `latest` symlink onto it.
    pub fn publish(&self, label: &str) -> Result<(), Error> {
        let partial = self.partial_path(label);
        let target = self.backup_path(label);
        if partial.exists() {
            std::fs::rename(&partial, &target).map_err(|err| {
                format_err!("unable to publish backup '{}' - {}", label, err)
            })?;
        } else if !target.exists() {
            return Err(
                BackupError::Assert(format!("nothing to publish for '{}'", label)).into(),
            );
        }
        self.update_latest(label)
    }

    fn update_latest(&self, label: &str) -> Result<(), Error> {
        let link = self.base.join(LATEST_LINK);
        let staging = self.base.join(".latest.new");
        let _ = std::fs::remove_file(&staging);
        std::os::unix::fs::symlink(label, &staging)
            .map_err(|err| format_err!("unable to stage latest pointer - {}", err))?;
        std::fs::rename(&staging, &link)
            .map_err(|err| format_err!("unable to swap latest pointer - {}", err))?;
        Ok(())
    }
}
