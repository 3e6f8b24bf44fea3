use chrono::{DateTime, Utc};
use conclave_halt::HaltError;
use conclave_ledger::LedgerError;
use conclave_signing::SigningError;
use conclave_types::{ApproverId, CeremonyId, CeremonyState, CeremonyType, Classified, ErrorClass};
use thiserror::Error;

pub type CeremonyResult<T> = Result<T, CeremonyError>;

#[derive(Error, Debug)]
pub enum CeremonyError {
    #[error("ceremony not found: {0}")]
    NotFound(CeremonyId),

    #[error(
        "quorum not met for {ceremony_id}: {approvals}/{required_approvals} approvals, {witnesses}/{required_witnesses} witnesses"
    )]
    QuorumNotMet {
        ceremony_id: CeremonyId,
        approvals: usize,
        required_approvals: usize,
        witnesses: usize,
        required_witnesses: usize,
    },

    #[error("cooling period for {ceremony_id} runs until {until}")]
    CoolingPeriodActive {
        ceremony_id: CeremonyId,
        until: DateTime<Utc>,
    },

    #[error("invalid transition for {ceremony_id}: {from} -> {to}")]
    InvalidTransition {
        ceremony_id: CeremonyId,
        from: CeremonyState,
        to: CeremonyState,
    },

    #[error("{requested} conflicts with active {active_type} ceremony {active}")]
    CeremonyConflict {
        requested: CeremonyType,
        active: CeremonyId,
        active_type: CeremonyType,
    },

    #[error("ceremony {0} expired")]
    Expired(CeremonyId),

    #[error("subject does not fit a {0} ceremony")]
    InvalidSubject(CeremonyType),

    #[error("unknown approver: {0}")]
    UnknownApprover(ApproverId),

    #[error("invalid approval from {approver}: {reason}")]
    InvalidApproval { approver: ApproverId, reason: String },

    #[error("{0} has already approved")]
    DuplicateApproval(ApproverId),

    #[error("approval from {approver} rejected by policy: {reason}")]
    PolicyRejected { approver: ApproverId, reason: String },

    #[error("no effect registered for {0}")]
    MissingEffect(CeremonyType),

    #[error("audit log corrupted at record {index}: {reason}")]
    AuditCorrupted { index: usize, reason: String },

    #[error(transparent)]
    Halt(#[from] HaltError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classified for CeremonyError {
    fn class(&self) -> ErrorClass {
        match self {
            CeremonyError::QuorumNotMet { .. }
            | CeremonyError::CoolingPeriodActive { .. }
            | CeremonyError::InvalidTransition { .. }
            | CeremonyError::CeremonyConflict { .. }
            | CeremonyError::Expired(_)
            | CeremonyError::InvalidSubject(_)
            | CeremonyError::DuplicateApproval(_)
            | CeremonyError::PolicyRejected { .. } => ErrorClass::Coordination,
            CeremonyError::UnknownApprover(_)
            | CeremonyError::InvalidApproval { .. }
            | CeremonyError::AuditCorrupted { .. } => ErrorClass::Integrity,
            CeremonyError::NotFound(_)
            | CeremonyError::MissingEffect(_)
            | CeremonyError::Io(_)
            | CeremonyError::Serialization(_) => ErrorClass::Operational,
            CeremonyError::Halt(e) => e.class(),
            CeremonyError::Ledger(e) => e.class(),
            CeremonyError::Signing(e) => e.class(),
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            CeremonyError::NotFound(_) => "CEREMONY_NOT_FOUND",
            CeremonyError::QuorumNotMet { .. } => "CEREMONY_QUORUM_NOT_MET",
            CeremonyError::CoolingPeriodActive { .. } => "CEREMONY_COOLING_PERIOD_ACTIVE",
            CeremonyError::InvalidTransition { .. } => "CEREMONY_INVALID_TRANSITION",
            CeremonyError::CeremonyConflict { .. } => "CEREMONY_CONFLICT",
            CeremonyError::Expired(_) => "CEREMONY_EXPIRED",
            CeremonyError::InvalidSubject(_) => "CEREMONY_INVALID_SUBJECT",
            CeremonyError::UnknownApprover(_) => "CEREMONY_UNKNOWN_APPROVER",
            CeremonyError::InvalidApproval { .. } => "CEREMONY_INVALID_APPROVAL",
            CeremonyError::DuplicateApproval(_) => "CEREMONY_DUPLICATE_APPROVAL",
            CeremonyError::PolicyRejected { .. } => "CEREMONY_POLICY_REJECTED",
            CeremonyError::MissingEffect(_) => "CEREMONY_MISSING_EFFECT",
            CeremonyError::AuditCorrupted { .. } => "CEREMONY_AUDIT_CORRUPTED",
            CeremonyError::Halt(e) => e.reason_code(),
            CeremonyError::Ledger(e) => e.reason_code(),
            CeremonyError::Signing(e) => e.reason_code(),
            CeremonyError::Io(_) => "CEREMONY_AUDIT_IO",
            CeremonyError::Serialization(_) => "CEREMONY_AUDIT_SERIALIZATION",
        }
    }
}
