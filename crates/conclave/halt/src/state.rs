use chrono::{DateTime, Utc};
use conclave_types::{CeremonyId, HaltId, SourceId};
use serde::{Deserialize, Serialize};

/// The halt that is currently in force.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub halt_id: HaltId,
    pub reason: String,
    pub source: SourceId,
    pub triggered_at: DateTime<Utc>,
    /// The aggregate trigger rate was exceeded while this halt was active.
    #[serde(default)]
    pub escalated: bool,
}

/// What a channel reports. Serialized as the durable flag body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HaltState {
    Running,
    Halted(HaltRecord),
}

impl HaltState {
    pub fn is_halted(&self) -> bool {
        matches!(self, HaltState::Halted(_))
    }

    pub fn record(&self) -> Option<&HaltRecord> {
        match self {
            HaltState::Halted(record) => Some(record),
            HaltState::Running => None,
        }
    }
}

impl Default for HaltState {
    fn default() -> Self {
        HaltState::Running
    }
}

/// Published to subscribers on every halt or clear.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum HaltTransition {
    Triggered(HaltRecord),
    Escalated {
        halt_id: HaltId,
        window_triggers: u32,
    },
    Cleared {
        halt_id: HaltId,
        ceremony_id: CeremonyId,
        cleared_at: DateTime<Utc>,
    },
}

/// Result of a successful trigger.
#[derive(Clone, Debug)]
pub struct HaltEvent {
    pub record: HaltRecord,
    /// A halt was already in force; this trigger joined it.
    pub already_halted: bool,
    /// Ledger sequence of the `HaltTriggered` record, if it was written.
    pub ledger_sequence: Option<u64>,
    /// Why the ledger record could not be written. The halt holds regardless.
    pub ledger_error: Option<String>,
}

/// Names the `HaltClear` ceremony that authorizes a clear.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyRef {
    pub ceremony_id: CeremonyId,
    pub halt_id: HaltId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_body_is_tagged() {
        let state = HaltState::Halted(HaltRecord {
            halt_id: HaltId::new(),
            reason: "key-compromise-suspected".into(),
            source: SourceId::new("operator"),
            triggered_at: Utc::now(),
            escalated: false,
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state\":\"halted\""));
        assert_eq!(serde_json::from_str::<HaltState>(&json).unwrap(), state);
        assert_eq!(
            serde_json::to_string(&HaltState::Running).unwrap(),
            "{\"state\":\"running\"}"
        );
    }
}
