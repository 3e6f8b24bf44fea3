//! The operator boundary.
//!
//! Component errors travel unmodified up to here. This is the one place
//! that turns them into something an operator reads.

use std::fmt::Display;

use conclave_types::{Classified, ErrorClass};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorNotice {
    pub reason_code: String,
    pub class: ErrorClass,
    pub message: String,
    pub escalation_contact: Option<String>,
    /// The system is halted and refusing mutations until a clear ceremony completes.
    pub paused_for_integrity: bool,
}

impl std::fmt::Display for OperatorNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.reason_code, self.message)?;
        if let Some(contact) = &self.escalation_contact {
            write!(f, " (escalate to {contact})")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BoundaryHandler {
    escalation_contact: String,
}

impl BoundaryHandler {
    pub fn new(escalation_contact: impl Into<String>) -> Self {
        Self {
            escalation_contact: escalation_contact.into(),
        }
    }

    /// Log `err` at a level matching its class and build the notice.
    ///
    /// Integrity, liveness and halt notices carry the escalation contact;
    /// coordination and operational ones do not.
    pub fn handle<E>(&self, err: &E) -> OperatorNotice
    where
        E: Classified + Display + ?Sized,
    {
        let class = err.class();
        let reason_code = err.reason_code();
        match class {
            ErrorClass::Integrity | ErrorClass::Liveness => {
                error!(reason_code, class = %class, error = %err, "Escalating to operator")
            }
            ErrorClass::Halted => warn!(reason_code, error = %err, "Rejected while paused for integrity"),
            ErrorClass::Operational => warn!(reason_code, error = %err, "Operational failure"),
            ErrorClass::Coordination => info!(reason_code, error = %err, "Coordination rejection"),
        }

        let paused = class == ErrorClass::Halted;
        let message = if paused {
            format!("System paused for integrity: {err}")
        } else {
            err.to_string()
        };
        OperatorNotice {
            reason_code: reason_code.to_string(),
            class,
            message,
            escalation_contact: class.must_propagate().then(|| self.escalation_contact.clone()),
            paused_for_integrity: paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_ceremony::CeremonyError;
    use conclave_halt::HaltError;
    use conclave_ledger::LedgerError;
    use conclave_types::{CeremonyId, ContentHash, HaltId};

    #[test]
    fn halted_presents_pause_notice() {
        let handler = BoundaryHandler::new("council@example.org");
        let err = HaltError::Halted {
            halt_id: HaltId::new(),
            reason: "key-compromise-suspected".into(),
        };
        let notice = handler.handle(&err);
        assert!(notice.paused_for_integrity);
        assert_eq!(notice.class, ErrorClass::Halted);
        assert_eq!(notice.reason_code, "HALT_ACTIVE");
        assert!(notice.message.starts_with("System paused for integrity"));
        assert_eq!(notice.escalation_contact.as_deref(), Some("council@example.org"));
    }

    #[test]
    fn integrity_escalates_coordination_does_not() {
        let handler = BoundaryHandler::new("oncall");
        let conflict = LedgerError::ChainConflict {
            head_sequence: 4,
            head_hash: ContentHash::hash(b"h4"),
            draft_sequence: 5,
            draft_previous: ContentHash::hash(b"other"),
        };
        let notice = handler.handle(&conflict);
        assert_eq!(notice.class, ErrorClass::Integrity);
        assert!(!notice.paused_for_integrity);
        assert!(notice.escalation_contact.is_some());

        let quorum = CeremonyError::QuorumNotMet {
            ceremony_id: CeremonyId::new(),
            approvals: 1,
            required_approvals: 2,
            witnesses: 0,
            required_witnesses: 0,
        };
        let notice = handler.handle(&quorum);
        assert_eq!(notice.class, ErrorClass::Coordination);
        assert!(notice.escalation_contact.is_none());
    }
}
