use conclave_ledger::LedgerError;
use conclave_types::{CeremonyId, Classified, ErrorClass, HaltId, SourceId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaltError {
    /// The system is halted. Callers propagate this unmodified.
    #[error("system halted ({halt_id}): {reason}")]
    Halted { halt_id: HaltId, reason: String },

    /// Neither channel could be read, so running cannot be confirmed.
    #[error("halt state unverifiable: {0}")]
    Unverifiable(String),

    #[error("halt trigger from {origin} suppressed by rate limit")]
    SourceRateLimited { origin: SourceId },

    #[error("system is not halted")]
    NotHalted,

    #[error("clear targets {requested} but the active halt is {current}")]
    HaltMismatch { current: HaltId, requested: HaltId },

    #[error("clear not authorized by ceremony {ceremony_id}: {reason}")]
    ClearNotAuthorized { ceremony_id: CeremonyId, reason: String },

    #[error("fast channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("durable flag error: {0}")]
    Flag(String),

    #[error("halt flag I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("halt flag serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl HaltError {
    pub fn is_halted(&self) -> bool {
        matches!(self, HaltError::Halted { .. } | HaltError::Unverifiable(_))
    }
}

impl Classified for HaltError {
    fn class(&self) -> ErrorClass {
        match self {
            HaltError::Halted { .. } | HaltError::Unverifiable(_) => ErrorClass::Halted,
            HaltError::HaltMismatch { .. } | HaltError::ClearNotAuthorized { .. } => {
                ErrorClass::Integrity
            }
            HaltError::NotHalted => ErrorClass::Coordination,
            HaltError::SourceRateLimited { .. }
            | HaltError::ChannelUnavailable(_)
            | HaltError::Flag(_)
            | HaltError::Io(_)
            | HaltError::Serialization(_) => ErrorClass::Operational,
            HaltError::Ledger(e) => e.class(),
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            HaltError::Halted { .. } => "HALT_ACTIVE",
            HaltError::Unverifiable(_) => "HALT_STATE_UNVERIFIABLE",
            HaltError::SourceRateLimited { .. } => "HALT_SOURCE_RATE_LIMITED",
            HaltError::NotHalted => "HALT_NOT_HALTED",
            HaltError::HaltMismatch { .. } => "HALT_ID_MISMATCH",
            HaltError::ClearNotAuthorized { .. } => "HALT_CLEAR_UNAUTHORIZED",
            HaltError::ChannelUnavailable(_) => "HALT_CHANNEL_UNAVAILABLE",
            HaltError::Flag(_) => "HALT_FLAG",
            HaltError::Io(_) => "HALT_FLAG_IO",
            HaltError::Serialization(_) => "HALT_FLAG_SERIALIZATION",
            HaltError::Ledger(e) => e.reason_code(),
        }
    }
}
