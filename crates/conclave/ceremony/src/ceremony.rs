use chrono::{DateTime, Utc};
use conclave_types::{ApproverId, CeremonyId, CeremonyState, CeremonySubject, CeremonyType, ContentHash, Tier};
use serde::{Deserialize, Serialize};

use crate::approval::{ApprovalRole, SignedApproval};
use crate::policy::TierRequirements;

/// One ceremony instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ceremony {
    pub id: CeremonyId,
    pub ceremony_type: CeremonyType,
    pub tier: Tier,
    pub subject: CeremonySubject,
    pub requested_by: ApproverId,
    pub requested_at: DateTime<Utc>,
    pub cooling_until: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub required_approvals: usize,
    pub required_witnesses: usize,
    pub state: CeremonyState,
    pub approvals: Vec<SignedApproval>,
    /// Why the effect failed, for `FAILED` ceremonies.
    pub failure: Option<String>,
    /// Hash of the last audit record written for this ceremony.
    pub last_record_hash: ContentHash,
}

impl Ceremony {
    pub(crate) fn new(
        ceremony_type: CeremonyType,
        subject: CeremonySubject,
        requested_by: ApproverId,
        requested_at: DateTime<Utc>,
        requirements: &TierRequirements,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            id: CeremonyId::new(),
            ceremony_type,
            tier: ceremony_type.tier(),
            subject,
            requested_by,
            requested_at,
            cooling_until: requested_at + requirements.cooling,
            expires_at: requested_at + timeout,
            required_approvals: requirements.approvals,
            required_witnesses: requirements.witnesses,
            state: CeremonyState::Pending,
            approvals: Vec::new(),
            failure: None,
            last_record_hash: ContentHash::zero(),
        }
    }

    pub fn approvers(&self) -> impl Iterator<Item = &SignedApproval> {
        self.approvals.iter().filter(|a| a.role == ApprovalRole::Approver)
    }

    pub fn witnesses(&self) -> impl Iterator<Item = &SignedApproval> {
        self.approvals.iter().filter(|a| a.role == ApprovalRole::Witness)
    }

    pub fn has_approved(&self, approver: &ApproverId) -> bool {
        self.approvals.iter().any(|a| &a.approver == approver)
    }

    pub fn quorum_met(&self) -> bool {
        self.approvers().count() >= self.required_approvals
            && self.witnesses().count() >= self.required_witnesses
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Only `PENDING` and `APPROVED` ceremonies time out.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, CeremonyState::Pending | CeremonyState::Approved) && now >= self.expires_at
    }

    pub fn cooling_elapsed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.cooling_until
    }

    /// Whether this ceremony blocks a new one of `ty` on `subject`.
    pub fn blocks(&self, ty: CeremonyType, subject: &CeremonySubject) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.ceremony_type.conflicts_with(&ty) {
            return true;
        }
        self.ceremony_type == ty && self.subject.scope().is_some() && self.subject.scope() == subject.scope()
    }
}
