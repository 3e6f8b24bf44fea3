//! Ceremony vocabulary shared by the engine, the halt controller and the
//! ledger's event catalogue.

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::ids::{HaltId, KeyId};

/// Severity classification of a ceremony.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Operational.
    Tier1,
    /// Schema / constitutional.
    Tier2,
    /// Fundamental.
    Tier3,
}

impl Tier {
    pub fn number(&self) -> u8 {
        match self {
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tier{}", self.number())
    }
}

/// The kinds of ceremony the engine knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CeremonyType {
    HaltClear,
    WriterFailover,
    ParameterChange,
    KeyRotation,
    SchemaAmendment,
    ConstitutionalAmendment,
    FundamentalAmendment,
}

impl CeremonyType {
    pub const ALL: [CeremonyType; 7] = [
        CeremonyType::HaltClear,
        CeremonyType::WriterFailover,
        CeremonyType::ParameterChange,
        CeremonyType::KeyRotation,
        CeremonyType::SchemaAmendment,
        CeremonyType::ConstitutionalAmendment,
        CeremonyType::FundamentalAmendment,
    ];

    /// Tier is a property of the type; callers cannot pick it.
    pub fn tier(&self) -> Tier {
        match self {
            CeremonyType::HaltClear
            | CeremonyType::WriterFailover
            | CeremonyType::ParameterChange => Tier::Tier1,
            CeremonyType::KeyRotation
            | CeremonyType::SchemaAmendment
            | CeremonyType::ConstitutionalAmendment => Tier::Tier2,
            CeremonyType::FundamentalAmendment => Tier::Tier3,
        }
    }

    /// Ceremonies that restore integrity may run while the system is halted.
    pub fn permitted_while_halted(&self) -> bool {
        matches!(self, CeremonyType::HaltClear | CeremonyType::WriterFailover)
    }

    fn is_amendment(&self) -> bool {
        matches!(
            self,
            CeremonyType::SchemaAmendment
                | CeremonyType::ConstitutionalAmendment
                | CeremonyType::FundamentalAmendment
        )
    }

    /// Whether two ceremony types may not be active at the same time.
    ///
    /// The relation is symmetric. Every type conflicts with itself except
    /// `ParameterChange`, which is scoped by parameter name instead.
    pub fn conflicts_with(&self, other: &CeremonyType) -> bool {
        use CeremonyType::*;
        match (self, other) {
            (ParameterChange, ParameterChange) => false,
            (a, b) if a == b => true,
            (KeyRotation, b) | (b, KeyRotation) if b.is_amendment() || *b == WriterFailover => {
                true
            }
            (a, b) if a.is_amendment() && b.is_amendment() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CeremonyType::HaltClear => "halt_clear",
            CeremonyType::WriterFailover => "writer_failover",
            CeremonyType::ParameterChange => "parameter_change",
            CeremonyType::KeyRotation => "key_rotation",
            CeremonyType::SchemaAmendment => "schema_amendment",
            CeremonyType::ConstitutionalAmendment => "constitutional_amendment",
            CeremonyType::FundamentalAmendment => "fundamental_amendment",
        }
    }
}

impl std::fmt::Display for CeremonyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceremony lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CeremonyState {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl CeremonyState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CeremonyState::Completed | CeremonyState::Failed | CeremonyState::Expired
        )
    }

    /// The fixed adjacency table. Nothing outside it is a legal transition.
    pub fn can_transition_to(&self, to: CeremonyState) -> bool {
        use CeremonyState::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Expired)
                | (Approved, Executing)
                | (Approved, Expired)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

impl std::fmt::Display for CeremonyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CeremonyState::Pending => "PENDING",
            CeremonyState::Approved => "APPROVED",
            CeremonyState::Executing => "EXECUTING",
            CeremonyState::Completed => "COMPLETED",
            CeremonyState::Failed => "FAILED",
            CeremonyState::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// What a ceremony acts on. Must agree with the ceremony type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CeremonySubject {
    Halt {
        halt_id: HaltId,
    },
    WriterFailover {
        previous_writer: String,
        new_writer: String,
    },
    Parameter {
        name: String,
        value: String,
    },
    KeyRotation {
        retiring: KeyId,
        successor: KeyId,
        /// Hex-encoded Ed25519 public key of the successor.
        successor_public_key: String,
    },
    Amendment {
        title: String,
        text_hash: ContentHash,
    },
}

impl CeremonySubject {
    /// Whether this subject may be the target of a ceremony of `ty`.
    pub fn matches(&self, ty: CeremonyType) -> bool {
        matches!(
            (self, ty),
            (CeremonySubject::Halt { .. }, CeremonyType::HaltClear)
                | (
                    CeremonySubject::WriterFailover { .. },
                    CeremonyType::WriterFailover
                )
                | (CeremonySubject::Parameter { .. }, CeremonyType::ParameterChange)
                | (CeremonySubject::KeyRotation { .. }, CeremonyType::KeyRotation)
                | (
                    CeremonySubject::Amendment { .. },
                    CeremonyType::SchemaAmendment
                        | CeremonyType::ConstitutionalAmendment
                        | CeremonyType::FundamentalAmendment
                )
        )
    }

    /// Scope key used for conflict detection of otherwise non-conflicting types.
    pub fn scope(&self) -> Option<&str> {
        match self {
            CeremonySubject::Parameter { name, .. } => Some(name),
            _ => None,
        }
    }
}
