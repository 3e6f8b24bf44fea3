//! Tier requirements and approval policy.

use std::collections::HashMap;

use chrono::Duration;
use conclave_types::{CeremonyType, Tier};
use serde::{Deserialize, Serialize};

use crate::approval::SignedApproval;
use crate::ceremony::Ceremony;

/// What a tier demands before a ceremony may execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierRequirements {
    pub approvals: usize,
    pub witnesses: usize,
    pub cooling: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CeremonyConfig {
    pub tier2_cooling_secs: i64,
    pub tier3_cooling_secs: i64,
    pub tier1_timeout_secs: i64,
    pub tier2_timeout_secs: i64,
    pub tier3_timeout_secs: i64,
    /// Per-type timeout overrides, keyed by `CeremonyType::as_str`.
    #[serde(default)]
    pub timeout_overrides: HashMap<String, i64>,
    pub sweep_interval_secs: u64,
    /// How stale a halt check may get while a ceremony is executing.
    #[serde(default = "default_halt_freshness_secs")]
    pub halt_freshness_secs: i64,
}

fn default_halt_freshness_secs() -> i64 {
    5
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            tier2_cooling_secs: 24 * 3600,
            tier3_cooling_secs: 72 * 3600,
            tier1_timeout_secs: 6 * 3600,
            tier2_timeout_secs: 7 * 24 * 3600,
            tier3_timeout_secs: 14 * 24 * 3600,
            timeout_overrides: HashMap::new(),
            sweep_interval_secs: 60,
            halt_freshness_secs: default_halt_freshness_secs(),
        }
    }
}

impl CeremonyConfig {
    /// Requirements for `tier` given the size of the approver pool.
    ///
    /// Tier 3 needs a two-thirds supermajority of the pool (never fewer than
    /// three) plus one external witness.
    pub fn requirements(&self, tier: Tier, pool_size: usize) -> TierRequirements {
        match tier {
            Tier::Tier1 => TierRequirements {
                approvals: 2,
                witnesses: 0,
                cooling: Duration::zero(),
            },
            Tier::Tier2 => TierRequirements {
                approvals: 3,
                witnesses: 0,
                cooling: Duration::seconds(self.tier2_cooling_secs),
            },
            Tier::Tier3 => TierRequirements {
                approvals: supermajority(pool_size).max(3),
                witnesses: 1,
                cooling: Duration::seconds(self.tier3_cooling_secs),
            },
        }
    }

    pub fn halt_freshness(&self) -> Duration {
        Duration::seconds(self.halt_freshness_secs)
    }

    pub fn timeout(&self, ceremony_type: CeremonyType) -> Duration {
        if let Some(secs) = self.timeout_overrides.get(ceremony_type.as_str()) {
            return Duration::seconds(*secs);
        }
        Duration::seconds(match ceremony_type.tier() {
            Tier::Tier1 => self.tier1_timeout_secs,
            Tier::Tier2 => self.tier2_timeout_secs,
            Tier::Tier3 => self.tier3_timeout_secs,
        })
    }
}

/// ⌈2n/3⌉
fn supermajority(pool: usize) -> usize {
    (2 * pool).div_ceil(3)
}

/// External approval rules (e.g. witness diversity). Core quorum and
/// cooling are enforced by the engine regardless.
pub trait ApprovalPolicy: Send + Sync {
    /// Called before `approval` is added to `ceremony`.
    fn admit(&self, ceremony: &Ceremony, approval: &SignedApproval) -> Result<(), String>;
}

/// Admits every correctly signed approval.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermitAll;

impl ApprovalPolicy for PermitAll {
    fn admit(&self, _ceremony: &Ceremony, _approval: &SignedApproval) -> Result<(), String> {
        Ok(())
    }
}

/// Rejects a witness whose organisation already witnessed the ceremony.
#[derive(Clone, Debug, Default)]
pub struct WitnessDiversity {
    organisations: HashMap<conclave_types::ApproverId, String>,
}

impl WitnessDiversity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_witness(mut self, witness: conclave_types::ApproverId, organisation: impl Into<String>) -> Self {
        self.organisations.insert(witness, organisation.into());
        self
    }
}

impl ApprovalPolicy for WitnessDiversity {
    fn admit(&self, ceremony: &Ceremony, approval: &SignedApproval) -> Result<(), String> {
        if approval.role != crate::approval::ApprovalRole::Witness {
            return Ok(());
        }
        let Some(org) = self.organisations.get(&approval.approver) else {
            return Err(format!("witness {} has no declared organisation", approval.approver.0));
        };
        let taken = ceremony
            .witnesses()
            .filter_map(|w| self.organisations.get(&w.approver))
            .any(|existing| existing == org);
        if taken {
            Err(format!("{org} has already witnessed this ceremony"))
        } else {
            Ok(())
        }
    }
}
