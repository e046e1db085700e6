//! The per-file copy worker.
//!
//! Re-entrant and host agnostic: the orchestrator calls it in-process
//! for local storage and over the line protocol for remote storage,
//! with the same parameter and result contract.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use crate::config::{CipherType, CompressType};
use crate::error::BackupError;

use super::{ChecksumReader, CryptConfig, PageVerifier, PageVerifyResult, RepoFileWriter};

/// Per-backup context shared by all copy jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyContext {
    /// Directory the backup is being written into.
    pub backup_dir: PathBuf,
    pub compress_type: CompressType,
    pub compress_level: u32,
    pub cipher_type: CipherType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_pass: Option<String>,
    pub delta: bool,
    pub buffer_size: usize,
    pub page_size: u32,
}

impl CopyContext {
    /// Derive the shared crypt config, once per worker.
    pub fn crypt_config(&self) -> Result<Option<CryptConfig>, Error> {
        match (self.cipher_type, &self.cipher_pass) {
            (CipherType::None, _) => Ok(None),
            (cipher_type, Some(pass)) => Ok(Some(CryptConfig::new(cipher_type, pass)?)),
            (_, None) => Err(BackupError::Assert(
                "cipher configured without a passphrase".to_string(),
            )
            .into()),
        }
    }
}

/// One copy job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyParams {
    /// Manifest name, also the repository-relative path before the
    /// compression extension.
    pub manifest_name: String,
    /// Absolute source path on the host the file is read from.
    pub source_path: PathBuf,
    /// A vanished source is an expected event for transient files.
    pub ignore_missing: bool,
    /// Size recorded when the manifest was built.
    pub size: u64,
    /// Stop reading at `size` even if the file has grown since.
    pub copy_exact_size: bool,
    /// Expected checksum from a prior backup or a resumed artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// The entry references a prior backup rather than this one.
    pub has_reference: bool,
    pub check_pages: bool,
    /// Pages with this LSN or newer pass validation unexamined.
    pub page_lsn_limit: u64,
    /// Page ordinal the file starts at (segment files).
    pub first_blkno: u32,
    /// An artifact for this file survived resume classification.
    pub resumable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyResultKind {
    Copied,
    Skipped,
    NoOp,
    ReCopied,
    ChecksumMatch,
}

impl CopyResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyResultKind::Copied => "copied",
            CopyResultKind::Skipped => "skipped",
            CopyResultKind::NoOp => "noop",
            CopyResultKind::ReCopied => "recopied",
            CopyResultKind::ChecksumMatch => "checksum-match",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CopyResult {
    pub kind: CopyResultKind,
    pub copy_size: u64,
    pub repo_size: u64,
    pub checksum: Option<String>,
    pub page_result: Option<PageVerifyResult>,
}

fn open_source(params: &CopyParams) -> Result<Option<File>, Error> {
    match File::open(&params.source_path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if params.ignore_missing {
                Ok(None)
            } else {
                Err(BackupError::FileMissing(
                    params.source_path.display().to_string(),
                )
                .into())
            }
        }
        Err(err) => Err(format_err!(
            "unable to open '{}' - {}",
            params.source_path.display(),
            err
        )),
    }
}

/// Checksum the source without copying, honoring the size limit.
/// `None` when the file vanished and that is tolerated.
fn source_checksum(
    params: &CopyParams,
    buffer_size: usize,
) -> Result<Option<(String, u64)>, Error> {
    let file = match open_source(params)? {
        Some(file) => file,
        None => return Ok(None),
    };

    let limit = if params.copy_exact_size {
        params.size
    } else {
        u64::MAX
    };
    let mut reader = ChecksumReader::new(file.take(limit));
    let mut buf = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && params.ignore_missing => {
                return Ok(None)
            }
            Err(err) => {
                return Err(format_err!(
                    "read error on '{}' - {}",
                    params.source_path.display(),
                    err
                ))
            }
        }
    }
    let (_, checksum, size) = reader.finish()?;
    Ok(Some((checksum, size)))
}

fn skipped() -> CopyResult {
    CopyResult {
        kind: CopyResultKind::Skipped,
        copy_size: 0,
        repo_size: 0,
        checksum: None,
        page_result: None,
    }
}

/// Copy one file into the repository.
pub fn backup_file(
    ctx: &CopyContext,
    crypt: Option<&CryptConfig>,
    params: &CopyParams,
) -> Result<CopyResult, Error> {
    let repo_path = ctx.backup_dir.join(format!(
        "{}{}",
        params.manifest_name,
        ctx.compress_type.extension()
    ));
    let repo_exists = repo_path.exists();

    // Delta verification: when the source still matches the expected
    // checksum there is nothing to copy. Files carrying a reference
    // keep pointing at the prior backup.
    if ctx.delta && params.checksum.is_some() && !params.resumable {
        match source_checksum(params, ctx.buffer_size)? {
            None => return Ok(skipped()),
            Some((checksum, size)) => {
                if Some(&checksum) == params.checksum.as_ref() && size == params.size {
                    return Ok(CopyResult {
                        kind: CopyResultKind::NoOp,
                        copy_size: size,
                        repo_size: 0,
                        checksum: Some(checksum),
                        page_result: None,
                    });
                }
            }
        }
    }

    // Resumed artifact: re-read the source; when it still matches the
    // saved checksum the artifact is accepted, otherwise it is
    // recopied below.
    if params.resumable && repo_exists {
        if let Some(expected) = &params.checksum {
            match source_checksum(params, ctx.buffer_size)? {
                None => return Ok(skipped()),
                Some((checksum, size)) => {
                    if &checksum == expected && size == params.size {
                        let repo_size = std::fs::metadata(&repo_path)?.len();
                        return Ok(CopyResult {
                            kind: CopyResultKind::ChecksumMatch,
                            copy_size: size,
                            repo_size,
                            checksum: Some(checksum),
                            page_result: None,
                        });
                    }
                }
            }
        }
    }

    let file = match open_source(params)? {
        Some(file) => file,
        None => return Ok(skipped()),
    };

    if let Some(parent) = repo_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = File::create(&repo_path)
        .map_err(|err| format_err!("unable to create '{}' - {}", repo_path.display(), err))?;
    let mut writer = RepoFileWriter::new(out, ctx.compress_type, ctx.compress_level, crypt)?;

    let limit = if params.copy_exact_size {
        params.size
    } else {
        u64::MAX
    };
    let mut reader = ChecksumReader::new(file.take(limit));
    let mut verifier = if params.check_pages {
        Some(PageVerifier::new(
            ctx.page_size as usize,
            params.first_blkno,
            params.page_lsn_limit,
        ))
    } else {
        None
    };

    let mut buf = vec![0u8; ctx.buffer_size];
    loop {
        let count = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && params.ignore_missing => {
                drop(writer);
                let _ = std::fs::remove_file(&repo_path);
                return Ok(skipped());
            }
            Err(err) => {
                return Err(format_err!(
                    "read error on '{}' - {}",
                    params.source_path.display(),
                    err
                ))
            }
        };
        if let Some(ref mut verifier) = verifier {
            verifier.update(&buf[..count]);
        }
        writer.write_all(&buf[..count])?;
    }

    let (out, repo_size) = writer.finish()?;
    out.sync_all()
        .map_err(|err| format_err!("unable to sync '{}' - {}", repo_path.display(), err))?;
    drop(out);
    let (_, checksum, copy_size) = reader.finish()?;

    // an empty file needs no repository artifact at all
    let repo_size = if copy_size == 0 {
        let _ = std::fs::remove_file(&repo_path);
        0
    } else {
        repo_size
    };

    let page_result: Option<PageVerifyResult> = verifier.map(|v| v.finish());

    let kind = if params.resumable && repo_exists {
        CopyResultKind::ReCopied
    } else {
        CopyResultKind::Copied
    };

    Ok(CopyResult {
        kind,
        copy_size,
        repo_size,
        checksum: Some(checksum),
        page_result,
    })
}

#[cfg(test)]
pub(crate) fn test_copy_context(backup_dir: PathBuf) -> CopyContext {
    CopyContext {
        backup_dir,
        compress_type: CompressType::None,
        compress_level: 0,
        cipher_type: CipherType::None,
        cipher_pass: None,
        delta: false,
        buffer_size: 64 * 1024,
        page_size: 8192,
    }
}
