use bundler_common::error::ErrorKind;
use thiserror::Error;

/// Error type for every pipeline stage (plan/prepare/post/seed/verify) and
/// for the storage and adapter layers they call into. Follows the teacher's
/// per-module `#[derive(Error, Debug)]` convention (see
/// `DiscoveryError`/`BlockchainError`), with one extra method,
/// [`BundlerError::kind`], that the queue dispatcher uses to decide
/// ack/nack (spec §7).
#[derive(Debug, Error)]
pub enum BundlerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("insufficient wallet balance: need {need}, have {have}")]
    InsufficientFunds { need: String, have: String },

    #[error("item {0} missing from object store")]
    MissingFromObjectStore(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("operation already applied, no-op: {0}")]
    AlreadyAdvanced(String),

    #[error("irrecoverable: {0}")]
    Irrecoverable(String),

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("bundle {0} not found")]
    BundleNotFound(String),
}

impl BundlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundlerError::Database(_) => ErrorKind::Transient,
            BundlerError::ObjectStore(_) => ErrorKind::Transient,
            BundlerError::Gateway(_) => ErrorKind::Transient,
            BundlerError::Timeout(_) => ErrorKind::Transient,
            BundlerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            BundlerError::MissingFromObjectStore(_) => ErrorKind::MissingArtifact,
            BundlerError::BadInput(_) => ErrorKind::BadInput,
            BundlerError::AlreadyAdvanced(_) => ErrorKind::AlreadyAdvanced,
            BundlerError::Irrecoverable(_) => ErrorKind::Irrecoverable,
            BundlerError::PlanNotFound(_) => ErrorKind::Irrecoverable,
            BundlerError::BundleNotFound(_) => ErrorKind::Irrecoverable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type BundlerResult<T> = Result<T, BundlerError>;
