use conclave_signing::SigningError;
use conclave_types::{Classified, ContentHash, ErrorClass, EventType};
use thiserror::Error;

/// Errors from the ledger store, its storage backends and replicas.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The draft does not extend the current head. Never auto-retried by the
    /// store: the signature is bound to the observed previous hash.
    #[error(
        "chain conflict: head is #{head_sequence} ({head_hash}), draft is #{draft_sequence} on {draft_previous}"
    )]
    ChainConflict {
        head_sequence: u64,
        head_hash: ContentHash,
        draft_sequence: u64,
        draft_previous: ContentHash,
    },

    #[error("invalid signature on event #{sequence}: {reason}")]
    InvalidSignature { sequence: u64, reason: String },

    #[error("schema violation for {event_type}: {reason}")]
    SchemaViolation { event_type: EventType, reason: String },

    /// A key lifecycle event the key registry cannot apply.
    #[error("key lifecycle event #{sequence} rejected: {reason}")]
    KeyLifecycle { sequence: u64, reason: String },

    #[error("event type {0} has no registered schema")]
    UnregisteredType(EventType),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("content hash mismatch at #{sequence}")]
    ContentHashMismatch { sequence: u64 },

    #[error("event #{sequence} already exists and cannot be modified")]
    ImmutabilityViolation { sequence: u64 },

    #[error("broken chain at #{sequence}: {reason}")]
    BrokenChain { sequence: u64, reason: String },

    #[error("replica diverged at #{sequence}: {detail}")]
    ReplicaDivergence { sequence: u64, detail: String },

    #[error("WAL corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("invalid range {from}..={to} (head is #{head})")]
    InvalidRange { from: u64, to: u64, head: u64 },

    #[error("ledger source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("WAL segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("WAL is closed")]
    Closed,
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<SigningError> for LedgerError {
    fn from(e: SigningError) -> Self {
        LedgerError::InvalidSignature {
            sequence: 0,
            reason: e.to_string(),
        }
    }
}

impl Classified for LedgerError {
    fn class(&self) -> ErrorClass {
        match self {
            LedgerError::ChainConflict { .. }
            | LedgerError::InvalidSignature { .. }
            | LedgerError::SchemaViolation { .. }
            | LedgerError::KeyLifecycle { .. }
            | LedgerError::UnregisteredType(_)
            | LedgerError::MissingField(_)
            | LedgerError::ContentHashMismatch { .. }
            | LedgerError::ImmutabilityViolation { .. }
            | LedgerError::BrokenChain { .. }
            | LedgerError::ReplicaDivergence { .. }
            | LedgerError::Corruption { .. } => ErrorClass::Integrity,
            LedgerError::SourceUnreachable(_) => ErrorClass::Liveness,
            LedgerError::InvalidRange { .. }
            | LedgerError::SegmentNotFound(_)
            | LedgerError::Io(_)
            | LedgerError::Serialization(_)
            | LedgerError::Closed => ErrorClass::Operational,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            LedgerError::ChainConflict { .. } => "LEDGER_CHAIN_CONFLICT",
            LedgerError::InvalidSignature { .. } => "LEDGER_INVALID_SIGNATURE",
            LedgerError::SchemaViolation { .. } => "LEDGER_SCHEMA_VIOLATION",
            LedgerError::KeyLifecycle { .. } => "LEDGER_KEY_LIFECYCLE",
            LedgerError::UnregisteredType(_) => "LEDGER_UNREGISTERED_TYPE",
            LedgerError::MissingField(_) => "LEDGER_MISSING_FIELD",
            LedgerError::ContentHashMismatch { .. } => "LEDGER_CONTENT_HASH_MISMATCH",
            LedgerError::ImmutabilityViolation { .. } => "LEDGER_IMMUTABILITY_VIOLATION",
            LedgerError::BrokenChain { .. } => "LEDGER_BROKEN_CHAIN",
            LedgerError::ReplicaDivergence { .. } => "LEDGER_REPLICA_DIVERGENCE",
            LedgerError::Corruption { .. } => "LEDGER_WAL_CORRUPTION",
            LedgerError::InvalidRange { .. } => "LEDGER_INVALID_RANGE",
            LedgerError::SourceUnreachable(_) => "LEDGER_SOURCE_UNREACHABLE",
            LedgerError::SegmentNotFound(_) => "LEDGER_SEGMENT_NOT_FOUND",
            LedgerError::Io(_) => "LEDGER_IO",
            LedgerError::Serialization(_) => "LEDGER_SERIALIZATION",
            LedgerError::Closed => "LEDGER_CLOSED",
        }
    }
}

impl LedgerError {
    /// Integrity rejections attributable to the submitter, counted as anomalies.
    pub fn is_submitter_fault(&self) -> bool {
        matches!(
            self,
            LedgerError::ChainConflict { .. }
                | LedgerError::InvalidSignature { .. }
                | LedgerError::SchemaViolation { .. }
                | LedgerError::KeyLifecycle { .. }
                | LedgerError::UnregisteredType(_)
                | LedgerError::MissingField(_)
        )
    }
}
