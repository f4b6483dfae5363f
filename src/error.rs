use crate::restore::RestoreStep;

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

/// Failures surfaced by the snapshot and supervisor operations.
///
/// Expected outcomes ("nothing to snapshot", "no snapshot found") are not
/// errors and are returned as values instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The sandbox did not answer its health probes. Retryable later.
    #[error("sandbox {sandbox_id} is unavailable after {attempts} health probes, try again later")]
    Unavailable { sandbox_id: String, attempts: u32 },

    #[error("snapshot {key} does not belong to {prefix}")]
    AccessDenied { key: String, prefix: String },

    #[error("snapshot {0} not found")]
    NotFound(String),

    /// Packaging or extraction exited non-zero; carries the command output.
    #[error("{step} failed: {diagnostic}")]
    ArchiveFailure {
        step: &'static str,
        diagnostic: String,
    },

    /// Moving archive bytes into or out of the sandbox failed.
    #[error("{step} failed: {cause:#}")]
    TransferFailure {
        step: &'static str,
        cause: anyhow::Error,
    },

    #[error("storage {step} failed: {cause:#}")]
    Storage {
        step: &'static str,
        cause: anyhow::Error,
    },

    #[error("persistent process failed to start: {0}")]
    ProcessStartup(String),

    #[error("restore failed while {step}: {source}")]
    Restore {
        step: RestoreStep,
        source: Box<SandboxError>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SandboxError {
    pub fn transfer(step: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        SandboxError::TransferFailure {
            step,
            cause: cause.into(),
        }
    }

    pub fn storage(step: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        SandboxError::Storage {
            step,
            cause: cause.into(),
        }
    }

    /// Strip restore step wrappers to reach the originating failure.
    pub fn innermost(&self) -> &SandboxError {
        match self {
            SandboxError::Restore { source, .. } => source.innermost(),
            other => other,
        }
    }
}
