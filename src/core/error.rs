/// Pipeline error taxonomy and process exit codes

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort a backup run
///
/// Every variant carries the diagnostic text shown to the operator. The
/// variant decides the process exit code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("connection to {target} failed: {message}")]
    ConnectionFailed { target: String, message: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("archive failed: {0}")]
    ArchiveFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),
}

/// Kind of a [`PipelineError`], without its diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigurationInvalid,
    ConnectionFailed,
    BackupFailed,
    TransferFailed,
    ArchiveFailed,
    UploadFailed,
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_UNEXPECTED: u8 = 1;

impl PipelineError {
    pub fn connection(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigurationInvalid(_) => ErrorKind::ConfigurationInvalid,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::BackupFailed(_) => ErrorKind::BackupFailed,
            Self::TransferFailed(_) => ErrorKind::TransferFailed,
            Self::ArchiveFailed(_) => ErrorKind::ArchiveFailed,
            Self::UploadFailed(_) => ErrorKind::UploadFailed,
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::ConfigurationInvalid => 2,
            ErrorKind::ConnectionFailed => 3,
            ErrorKind::BackupFailed => 4,
            ErrorKind::TransferFailed => 5,
            ErrorKind::ArchiveFailed => 6,
            ErrorKind::UploadFailed => 7,
        }
    }

    /// Wrap a diagnostic in an error of this kind
    ///
    /// `ConnectionFailed` has no target here; callers that know the target use
    /// [`PipelineError::connection`].
    pub fn with_message(self, message: impl Into<String>) -> PipelineError {
        let message = message.into();
        match self {
            ErrorKind::ConfigurationInvalid => PipelineError::ConfigurationInvalid(message),
            ErrorKind::ConnectionFailed => PipelineError::ConnectionFailed {
                target: "remote host".to_string(),
                message,
            },
            ErrorKind::BackupFailed => PipelineError::BackupFailed(message),
            ErrorKind::TransferFailed => PipelineError::TransferFailed(message),
            ErrorKind::ArchiveFailed => PipelineError::ArchiveFailed(message),
            ErrorKind::UploadFailed => PipelineError::UploadFailed(message),
        }
    }
}

/// Await a gateway call under `limit`, mapping failure and timeout to `kind`
pub async fn bounded<T, F>(
    limit: Duration,
    kind: ErrorKind,
    action: &str,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(kind.with_message(format!("{}: {:#}", action, e))),
        Err(_) => Err(kind.with_message(format!(
            "{} timed out after {}",
            action,
            humantime::format_duration(limit)
        ))),
    }
}

/// Exit code for an error surfaced from `main`
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(EXIT_UNEXPECTED)
}
