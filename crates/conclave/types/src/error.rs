//! Error classification shared by every Conclave component.
//!
//! Each crate keeps its own `thiserror` enum; all of them implement
//! [`Classified`] so the kernel's boundary handler can decide what an
//! operator sees without matching on foreign variants.

use serde::{Deserialize, Serialize};

/// The propagation class of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Chain, signature, schema or context integrity. Never corrected or retried.
    Integrity,
    /// Ceremony coordination. The immediate caller may handle and retry.
    Coordination,
    /// Writer liveness. Escalates to halt.
    Liveness,
    /// The system is halted. Propagates unmodified.
    Halted,
    /// Configuration, I/O and other operator-actionable failures.
    Operational,
}

impl ErrorClass {
    /// Integrity and liveness errors must reach the outermost boundary.
    pub fn must_propagate(&self) -> bool {
        matches!(
            self,
            ErrorClass::Integrity | ErrorClass::Liveness | ErrorClass::Halted
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Integrity => "integrity",
            ErrorClass::Coordination => "coordination",
            ErrorClass::Liveness => "liveness",
            ErrorClass::Halted => "halted",
            ErrorClass::Operational => "operational",
        };
        f.write_str(s)
    }
}

/// Implemented by every component error type.
pub trait Classified {
    fn class(&self) -> ErrorClass;

    /// Stable, operator-facing reason code (e.g. `LEDGER_CHAIN_CONFLICT`).
    fn reason_code(&self) -> &'static str;

    /// Only coordination errors may be retried, and only by the immediate caller.
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Coordination
    }
}
