//! Tiered, witnessed ceremonies.
//!
//! A ceremony is a multi-party transaction over a fixed state machine
//! (`PENDING → APPROVED → EXECUTING → COMPLETED | FAILED`, with `EXPIRED` on
//! timeout). Its tier, derived from the ceremony type, sets quorum, witness
//! and cooling requirements. Every step is signed into a hash-chained prepare
//! log before its effect runs.

pub mod approval;
pub mod audit;
pub mod ceremony;
pub mod effect;
pub mod engine;
pub mod error;
pub mod policy;

pub use approval::{approval_message, ApprovalRole, ApproverRegistry, SignedApproval};
pub use audit::{AuditEntry, AuditLog, AuditRecord, AuditStore, FileAuditStore, MemoryAuditStore};
pub use ceremony::Ceremony;
pub use effect::{
    AmendmentEffect, CeremonyEffect, EffectRegistry, FailoverEffect, FailoverHandler, HaltClearEffect,
    KeyRotationEffect, ParameterEffect, ParameterTable,
};
pub use engine::{CeremonyEngine, RecoveryReport};
pub use error::{CeremonyError, CeremonyResult};
pub use policy::{ApprovalPolicy, CeremonyConfig, PermitAll, TierRequirements, WitnessDiversity};
