use conclave_ledger::LedgerError;
use conclave_signing::SigningError;
use conclave_types::{BundleId, Classified, ContentHash, ErrorClass};
use thiserror::Error;

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Error, Debug)]
pub enum ContextError {
    /// The bundle no longer reflects the canonical chain closely enough.
    #[error("stale context {bundle_id} at #{as_of_sequence} (head #{head}): {reason}")]
    StaleContext {
        bundle_id: BundleId,
        as_of_sequence: u64,
        head: u64,
        reason: String,
    },

    #[error("sequence #{sequence} is not in the canonical chain (head #{head})")]
    SequenceNotFound { sequence: u64, head: u64 },

    #[error("unresolvable precedent reference {0}")]
    UnresolvablePrecedent(ContentHash),

    #[error("bundle {bundle_id} failed verification: {reason}")]
    BundleTampered { bundle_id: BundleId, reason: String },

    #[error("bundle {0} already stored")]
    BundleExists(BundleId),

    #[error("bundle not found: {0}")]
    BundleNotFound(BundleId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("bundle store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classified for ContextError {
    fn class(&self) -> ErrorClass {
        match self {
            ContextError::StaleContext { .. }
            | ContextError::SequenceNotFound { .. }
            | ContextError::UnresolvablePrecedent(_)
            | ContextError::BundleTampered { .. }
            | ContextError::BundleExists(_) => ErrorClass::Integrity,
            ContextError::Ledger(e) => e.class(),
            ContextError::Signing(_) => ErrorClass::Integrity,
            ContextError::BundleNotFound(_) | ContextError::Io(_) | ContextError::Serialization(_) => {
                ErrorClass::Operational
            }
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            ContextError::StaleContext { .. } => "CONTEXT_STALE",
            ContextError::SequenceNotFound { .. } => "CONTEXT_SEQUENCE_NOT_FOUND",
            ContextError::UnresolvablePrecedent(_) => "CONTEXT_UNRESOLVABLE_PRECEDENT",
            ContextError::BundleTampered { .. } => "CONTEXT_BUNDLE_TAMPERED",
            ContextError::BundleExists(_) => "CONTEXT_BUNDLE_EXISTS",
            ContextError::BundleNotFound(_) => "CONTEXT_BUNDLE_NOT_FOUND",
            ContextError::Ledger(e) => e.reason_code(),
            ContextError::Signing(_) => "CONTEXT_SIGNING",
            ContextError::Io(_) => "CONTEXT_IO",
            ContextError::Serialization(_) => "CONTEXT_SERIALIZATION",
        }
    }
}
