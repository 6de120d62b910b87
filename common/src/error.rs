// The error-kind taxonomy every stage-specific error enum maps into.
//
// This mirrors the teacher's convention of one `thiserror` enum per module
// (`DiscoveryError`, `BalanceError`, ...) but adds a single shared
// classification so the queue dispatcher (core::queue) can decide ack/nack
// without matching on every concrete error type.

use thiserror::Error;

/// How a failure should be treated by the stage that produced it and by the
/// queue dispatcher that invoked the stage. See spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, DB deadlock, gateway 5xx, timeout: nack, let the queue retry.
    Transient,
    /// Malformed input caught at ingest: no retry (ingest is out of scope
    /// for this crate, but the kind is shared so stores can reuse it).
    BadInput,
    /// Wallet balance below the reward at post time: nack, retryable, but
    /// logged loudly so an operator notices the pipeline is stalled.
    InsufficientFunds,
    /// The object store lost an item: handled per-item, not fatal to the
    /// whole bundle.
    MissingArtifact,
    /// The transactional store observed the row already in a later state:
    /// treated as success.
    AlreadyAdvanced,
    /// A data invariant was violated (e.g. a plan references ids absent
    /// from every data item table): logged, acked, surfaced as a metric.
    Irrecoverable,
}

impl ErrorKind {
    /// Whether the queue dispatcher should nack (redeliver) a message that
    /// failed with this kind, versus ack it because nothing more can be
    /// done right now.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::InsufficientFunds)
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn irrecoverable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Irrecoverable, message)
    }
}
