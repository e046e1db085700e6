//! Typed error kinds.
//!
//! Most code propagates `anyhow::Error`. The kinds below mark the
//! errors with a defined recovery or exit policy so callers can
//! `downcast_ref` where the policy differs from plain propagation:
//! ignore-missing file skips, manifest copy fallback and resume
//! classification are the only local recoveries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Source file disappeared before or during read.
    #[error("unable to open missing file '{0}'")]
    FileMissing(String),

    /// Integrity check of persisted data failed.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// Persisted data cannot be parsed.
    #[error("format error: {0}")]
    Format(String),

    /// Cluster identity does not match the stanza.
    #[error("backup mismatch: {0}")]
    BackupMismatch(String),

    /// WAL archive did not catch up within archive-timeout.
    #[error("archive timeout: {0}")]
    ArchiveTimeout(String),

    /// Offline backup refused because the cluster is running.
    #[error("postmaster running: {0}")]
    PostmasterRunning(String),

    /// Subprocess transport stalled past protocol-timeout.
    #[error("protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// Remote host unreachable.
    #[error("host connect error: {0}")]
    HostConnect(String),

    /// Internal invariant violated.
    #[error("assertion failed: {0}")]
    Assert(String),
}

impl BackupError {
    /// Stable numeric code used in protocol error envelopes.
    pub fn code(&self) -> u32 {
        match self {
            BackupError::FileMissing(_) => 55,
            BackupError::Checksum(_) => 38,
            BackupError::Format(_) => 39,
            BackupError::BackupMismatch(_) => 50,
            BackupError::ArchiveTimeout(_) => 62,
            BackupError::PostmasterRunning(_) => 64,
            BackupError::ProtocolTimeout(_) => 66,
            BackupError::HostConnect(_) => 67,
            BackupError::Assert(_) => 25,
        }
    }
}

/// Check whether an error chain bottoms out in the given kind.
pub fn is_file_missing(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<BackupError>(), Some(BackupError::FileMissing(_)))
}

pub fn is_checksum_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<BackupError>(), Some(BackupError::Checksum(_)))
}
