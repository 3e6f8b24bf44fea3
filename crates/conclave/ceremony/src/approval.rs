//! Signed approvals and the approver registry.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use conclave_signing::crypto;
use conclave_types::{ApproverId, CeremonyId, CeremonySubject, CeremonyType, SignatureBytes};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CeremonyError, CeremonyResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRole {
    /// Counts toward quorum.
    Approver,
    /// External witness. Counts toward the witness requirement only.
    Witness,
}

impl ApprovalRole {
    fn as_str(&self) -> &'static str {
        match self {
            ApprovalRole::Approver => "approver",
            ApprovalRole::Witness => "witness",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedApproval {
    pub approver: ApproverId,
    pub role: ApprovalRole,
    pub signed_at: DateTime<Utc>,
    pub signature: SignatureBytes,
}

/// The bytes an approver signs. Binds the ceremony id, its type and subject.
pub fn approval_message(
    ceremony_id: &CeremonyId,
    ceremony_type: CeremonyType,
    subject: &CeremonySubject,
    role: ApprovalRole,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"conclave-approval-v1:");
    out.extend_from_slice(ceremony_id.0.as_bytes());
    out.extend_from_slice(ceremony_type.as_str().as_bytes());
    out.push(0);
    out.extend_from_slice(role.as_str().as_bytes());
    out.push(0);
    out.extend_from_slice(&serde_json::to_vec(subject)?);
    Ok(out)
}

impl SignedApproval {
    /// Sign an approval with a locally held key. Used by operator tooling and tests.
    pub fn sign(
        approver: ApproverId,
        role: ApprovalRole,
        key: &SigningKey,
        ceremony_id: &CeremonyId,
        ceremony_type: CeremonyType,
        subject: &CeremonySubject,
        signed_at: DateTime<Utc>,
    ) -> CeremonyResult<Self> {
        let message = approval_message(ceremony_id, ceremony_type, subject, role)?;
        Ok(Self {
            approver,
            role,
            signed_at,
            signature: crypto::sign_with(key, &message),
        })
    }
}

#[derive(Clone, Debug)]
struct Registration {
    public_key: String,
    role: ApprovalRole,
}

/// Registered approvers and external witnesses with their public keys.
#[derive(Default)]
pub struct ApproverRegistry {
    entries: RwLock<HashMap<ApproverId, Registration>>,
}

impl ApproverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, approver: ApproverId, public_key: String, role: ApprovalRole) -> CeremonyResult<()> {
        crypto::parse_public_key(&public_key)?;
        info!(approver = %approver.0, role = role.as_str(), "Approver registered");
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(approver, Registration { public_key, role });
        Ok(())
    }

    pub fn is_registered(&self, approver: &ApproverId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(approver)
    }

    /// Number of registered approvers (witnesses excluded).
    pub fn pool_size(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.role == ApprovalRole::Approver)
            .count()
    }

    /// Check that `approval` is from a registered party in the claimed role
    /// and that its signature covers this ceremony.
    pub fn verify(
        &self,
        approval: &SignedApproval,
        ceremony_id: &CeremonyId,
        ceremony_type: CeremonyType,
        subject: &CeremonySubject,
    ) -> CeremonyResult<()> {
        let registration = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&approval.approver)
            .cloned()
            .ok_or_else(|| CeremonyError::UnknownApprover(approval.approver.clone()))?;

        let invalid = |reason: String| CeremonyError::InvalidApproval {
            approver: approval.approver.clone(),
            reason,
        };
        if registration.role != approval.role {
            return Err(invalid(format!(
                "registered as {}, signed as {}",
                registration.role.as_str(),
                approval.role.as_str()
            )));
        }
        let key = crypto::parse_public_key(&registration.public_key).map_err(|e| invalid(e.to_string()))?;
        let message = approval_message(ceremony_id, ceremony_type, subject, approval.role)?;
        crypto::verify_with(&key, &message, &approval.signature)
            .map_err(|_| invalid("signature does not cover this ceremony".into()))
    }
}
