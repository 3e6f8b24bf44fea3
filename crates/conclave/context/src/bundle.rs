//! The context bundle: a signed, point-in-time view of ledger state handed
//! to one agent invocation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use conclave_types::{BundleId, ContentHash, KeyId, SessionId, SignatureBytes};
use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

/// Latest recorded state for one subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRef {
    pub subject: String,
    pub state_kind: String,
    /// Content hash of the `StateRecorded` event.
    pub event_hash: ContentHash,
    pub sequence: u64,
}

/// A precedent, addressed by the content hash of its `PrecedentEstablished` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedentRef {
    pub precedent_id: String,
    pub event_hash: ContentHash,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub bundle_id: BundleId,
    pub session_id: SessionId,
    pub as_of_sequence: u64,
    pub as_of_hash: ContentHash,
    /// Content hash of the latest `IdentityDeclared` event, if any.
    pub identity_ref: Option<ContentHash>,
    /// Sorted by subject.
    pub state_refs: Vec<StateRef>,
    /// Sorted by precedent id, then sequence.
    pub precedent_refs: Vec<PrecedentRef>,
    pub created_at: DateTime<Utc>,
    pub bundle_hash: ContentHash,
    pub signature: SignatureBytes,
    pub signing_key_id: KeyId,
}

#[derive(Serialize)]
struct BundleBody<'a> {
    bundle_id: &'a BundleId,
    session_id: &'a SessionId,
    as_of_sequence: u64,
    as_of_hash: &'a ContentHash,
    identity_ref: &'a Option<ContentHash>,
    state_refs: &'a [StateRef],
    precedent_refs: &'a [PrecedentRef],
    created_at: &'a DateTime<Utc>,
}

impl ContextBundle {
    /// Hash over everything except the hash itself and the signature.
    pub fn compute_hash(&self) -> ContextResult<ContentHash> {
        let body = BundleBody {
            bundle_id: &self.bundle_id,
            session_id: &self.session_id,
            as_of_sequence: self.as_of_sequence,
            as_of_hash: &self.as_of_hash,
            identity_ref: &self.identity_ref,
            state_refs: &self.state_refs,
            precedent_refs: &self.precedent_refs,
            created_at: &self.created_at,
        };
        let mut bytes = b"conclave-context-v1:".to_vec();
        bytes.extend_from_slice(&serde_json::to_vec(&body)?);
        Ok(ContentHash::hash(&bytes))
    }

    pub fn state(&self, subject: &str) -> Option<&StateRef> {
        self.state_refs
            .binary_search_by(|s| s.subject.as_str().cmp(subject))
            .ok()
            .map(|i| &self.state_refs[i])
    }

    pub fn resolves(&self, precedent: &ContentHash) -> bool {
        self.precedent_refs.iter().any(|p| &p.event_hash == precedent)
    }

    /// Reject a decision that cites any precedent this bundle cannot resolve.
    pub fn validate_citations(&self, cited: &[ContentHash]) -> ContextResult<()> {
        let known: HashSet<&ContentHash> = self.precedent_refs.iter().map(|p| &p.event_hash).collect();
        match cited.iter().find(|c| !known.contains(c)) {
            Some(missing) => Err(ContextError::UnresolvablePrecedent(*missing)),
            None => Ok(()),
        }
    }
}
