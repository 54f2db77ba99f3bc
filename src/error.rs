use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("converter binary unavailable: {0}")]
    Unavailable(String),
    #[error("failed to spawn converter for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("converter timed out after {secs}s")]
    TimedOut { secs: u64 },
    #[error("converter exited with {code}: {stderr}")]
    Failed { code: String, stderr: String },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session registry unreadable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session registry corrupt at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("session registry would hold {session_id} twice or date {acq_time} twice")]
    Duplicate { session_id: String, acq_time: String },
    #[error("session registry exhausted: no free session ordinal up to {max}")]
    Exhausted { max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnCode {
    W001MalformedVisit,
    W002ConvertFailed,
    W003MissingDerivative,
    W004MissingSidecar,
    W005DuplicateModality,
    W006MalformedSession,
    W007SessionAlreadyReconciled,
    W008ArchiveUnreadable,
    W009LedgerUnreadable,
    W010RegistryFailed,
}

impl WarnCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::W001MalformedVisit => "W001_MALFORMED_VISIT",
            Self::W002ConvertFailed => "W002_CONVERT_FAILED",
            Self::W003MissingDerivative => "W003_MISSING_DERIVATIVE",
            Self::W004MissingSidecar => "W004_MISSING_SIDECAR",
            Self::W005DuplicateModality => "W005_DUPLICATE_MODALITY",
            Self::W006MalformedSession => "W006_MALFORMED_SESSION",
            Self::W007SessionAlreadyReconciled => "W007_SESSION_ALREADY_RECONCILED",
            Self::W008ArchiveUnreadable => "W008_ARCHIVE_UNREADABLE",
            Self::W009LedgerUnreadable => "W009_LEDGER_UNREADABLE",
            Self::W010RegistryFailed => "W010_REGISTRY_FAILED",
        }
    }
}
