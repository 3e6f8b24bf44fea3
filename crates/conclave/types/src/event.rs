//! The closed event catalogue and the hash/sign preimage every event is bound to.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ceremony::{CeremonyState, CeremonySubject, CeremonyType, Tier};
use crate::hash::ContentHash;
use crate::ids::{CeremonyId, HaltId, KeyId, SourceId};

const EVENT_DOMAIN_TAG: &[u8] = b"conclave-event-v1:";
const WITNESS_DOMAIN_TAG: &[u8] = b"conclave-witness-v1:";

/// Every event type the ledger accepts. Nothing else can be appended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    HaltTriggered,
    HaltCleared,
    HaltEscalated,
    CeremonyTransitioned,
    KeyActivated,
    KeyRevoked,
    WriterFailover,
    AmendmentRatified,
    IntegrityFault,
    IdentityDeclared,
    StateRecorded,
    PrecedentEstablished,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::HaltTriggered,
        EventType::HaltCleared,
        EventType::HaltEscalated,
        EventType::CeremonyTransitioned,
        EventType::KeyActivated,
        EventType::KeyRevoked,
        EventType::WriterFailover,
        EventType::AmendmentRatified,
        EventType::IntegrityFault,
        EventType::IdentityDeclared,
        EventType::StateRecorded,
        EventType::PrecedentEstablished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HaltTriggered => "halt_triggered",
            EventType::HaltCleared => "halt_cleared",
            EventType::HaltEscalated => "halt_escalated",
            EventType::CeremonyTransitioned => "ceremony_transitioned",
            EventType::KeyActivated => "key_activated",
            EventType::KeyRevoked => "key_revoked",
            EventType::WriterFailover => "writer_failover",
            EventType::AmendmentRatified => "amendment_ratified",
            EventType::IntegrityFault => "integrity_fault",
            EventType::IdentityDeclared => "identity_declared",
            EventType::StateRecorded => "state_recorded",
            EventType::PrecedentEstablished => "precedent_established",
        }
    }

    /// Types only the kernel itself writes. Collaborator submissions of
    /// these are refused.
    pub fn is_kernel_authored(&self) -> bool {
        !matches!(
            self,
            EventType::IdentityDeclared | EventType::StateRecorded | EventType::PrecedentEstablished
        )
    }

    /// Stable ordinal mixed into the content hash.
    pub fn ordinal(&self) -> u8 {
        match self {
            EventType::HaltTriggered => 0,
            EventType::HaltCleared => 1,
            EventType::HaltEscalated => 2,
            EventType::CeremonyTransitioned => 3,
            EventType::KeyActivated => 4,
            EventType::KeyRevoked => 5,
            EventType::WriterFailover => 6,
            EventType::AmendmentRatified => 7,
            EventType::IntegrityFault => 8,
            EventType::IdentityDeclared => 9,
            EventType::StateRecorded => 10,
            EventType::PrecedentEstablished => 11,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific event payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    // Halt controller
    HaltTriggered {
        halt_id: HaltId,
        reason: String,
        source: SourceId,
        /// Set when the aggregate trigger rate was exceeded.
        escalated: bool,
    },
    HaltCleared {
        halt_id: HaltId,
        ceremony_id: CeremonyId,
    },
    HaltEscalated {
        window_triggers: u32,
        sources: Vec<SourceId>,
    },

    // Ceremony engine
    CeremonyTransitioned {
        ceremony_id: CeremonyId,
        ceremony_type: CeremonyType,
        tier: Tier,
        subject: CeremonySubject,
        from: Option<CeremonyState>,
        to: CeremonyState,
        audit_record_hash: ContentHash,
    },

    // Key registry
    KeyActivated {
        key_id: KeyId,
        public_key: String,
        /// The key this one rotates out, if any.
        supersedes: Option<KeyId>,
        ceremony_id: Option<CeremonyId>,
    },
    KeyRevoked {
        key_id: KeyId,
        reason: String,
        ceremony_id: Option<CeremonyId>,
    },

    // Ceremony effects
    WriterFailover {
        ceremony_id: CeremonyId,
        previous_writer: String,
        new_writer: String,
    },
    AmendmentRatified {
        ceremony_id: CeremonyId,
        amendment_kind: CeremonyType,
        title: String,
        text_hash: ContentHash,
    },

    // Replicas and anomaly tracking
    IntegrityFault {
        fault_kind: String,
        detail: String,
    },

    // Collaborator submissions
    IdentityDeclared {
        subject: String,
        identity_hash: ContentHash,
    },
    StateRecorded {
        subject: String,
        state_kind: String,
        state_hash: ContentHash,
    },
    PrecedentEstablished {
        precedent_id: String,
        summary_hash: ContentHash,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::HaltTriggered { .. } => EventType::HaltTriggered,
            EventPayload::HaltCleared { .. } => EventType::HaltCleared,
            EventPayload::HaltEscalated { .. } => EventType::HaltEscalated,
            EventPayload::CeremonyTransitioned { .. } => EventType::CeremonyTransitioned,
            EventPayload::KeyActivated { .. } => EventType::KeyActivated,
            EventPayload::KeyRevoked { .. } => EventType::KeyRevoked,
            EventPayload::WriterFailover { .. } => EventType::WriterFailover,
            EventPayload::AmendmentRatified { .. } => EventType::AmendmentRatified,
            EventPayload::IntegrityFault { .. } => EventType::IntegrityFault,
            EventPayload::IdentityDeclared { .. } => EventType::IdentityDeclared,
            EventPayload::StateRecorded { .. } => EventType::StateRecorded,
            EventPayload::PrecedentEstablished { .. } => EventType::PrecedentEstablished,
        }
    }
}

/// Raw signature bytes, hex-encoded on the wire.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SignatureBytes(pub Vec<u8>);

impl SignatureBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 || !hex.is_ascii() {
            return None;
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        write!(f, "SignatureBytes({})", &hex[..hex.len().min(16)])
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        SignatureBytes::from_hex(&hex).ok_or_else(|| serde::de::Error::custom("invalid signature hex"))
    }
}

/// An independent co-signature over an event's content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessRef {
    pub witness_key_id: KeyId,
    pub signature: SignatureBytes,
}

/// The bytes a writer signs and whose BLAKE3 digest is the content hash.
///
/// Covers type, sequence, timestamp, payload version, payload and previous
/// hash. Fails only if the payload cannot be encoded.
pub fn signable_bytes(
    sequence: u64,
    event_type: EventType,
    timestamp: &DateTime<Utc>,
    payload_version: u16,
    payload: &EventPayload,
    previous_hash: &ContentHash,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(EVENT_DOMAIN_TAG);
    buf.push(event_type.ordinal());
    buf.extend_from_slice(&sequence.to_le_bytes());

    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
    buf.extend_from_slice(&(ts.len() as u32).to_le_bytes());
    buf.extend_from_slice(ts.as_bytes());

    buf.extend_from_slice(&payload_version.to_le_bytes());

    let payload_bytes = serde_json::to_vec(payload)?;
    buf.extend_from_slice(&(payload_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload_bytes);

    buf.extend_from_slice(previous_hash.as_bytes());
    Ok(buf)
}

/// The message a witness signs for an event with `content_hash`.
pub fn witness_message(content_hash: &ContentHash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(WITNESS_DOMAIN_TAG.len() + 32);
    msg.extend_from_slice(WITNESS_DOMAIN_TAG);
    msg.extend_from_slice(content_hash.as_bytes());
    msg
}

/// A pre-signed submission referencing the submitter's observed head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub sequence: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload_version: u16,
    pub payload: EventPayload,
    pub previous_hash: ContentHash,
    pub signature: SignatureBytes,
    pub signing_key_id: KeyId,
    pub witness_refs: Vec<WitnessRef>,
}

impl EventDraft {
    /// An unsigned draft that extends `head`. Sign [`EventDraft::signable_bytes`]
    /// and attach the result with [`EventDraft::signed`].
    pub fn unsigned(
        head: &LedgerHead,
        payload: EventPayload,
        payload_version: u16,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: head.next_sequence(),
            event_type: payload.event_type(),
            timestamp,
            payload_version,
            payload,
            previous_hash: head.hash,
            signature: SignatureBytes::default(),
            signing_key_id: KeyId::new(""),
            witness_refs: Vec::new(),
        }
    }

    pub fn signed(mut self, signature: SignatureBytes, signing_key_id: KeyId) -> Self {
        self.signature = signature;
        self.signing_key_id = signing_key_id;
        self
    }

    pub fn with_witness(mut self, witness: WitnessRef) -> Self {
        self.witness_refs.push(witness);
        self
    }

    pub fn signable_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        signable_bytes(
            self.sequence,
            self.event_type,
            &self.timestamp,
            self.payload_version,
            &self.payload,
            &self.previous_hash,
        )
    }

    pub fn content_hash(&self) -> Result<ContentHash, serde_json::Error> {
        Ok(ContentHash::hash(&self.signable_bytes()?))
    }
}

/// A committed ledger event. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload_version: u16,
    pub payload: EventPayload,
    pub previous_hash: ContentHash,
    pub content_hash: ContentHash,
    pub signature: SignatureBytes,
    pub signing_key_id: KeyId,
    pub witness_refs: Vec<WitnessRef>,
}

impl Event {
    /// Seal a draft whose content hash has already been checked.
    pub fn from_draft(draft: EventDraft, content_hash: ContentHash) -> Self {
        Self {
            sequence: draft.sequence,
            event_type: draft.event_type,
            timestamp: draft.timestamp,
            payload_version: draft.payload_version,
            payload: draft.payload,
            previous_hash: draft.previous_hash,
            content_hash,
            signature: draft.signature,
            signing_key_id: draft.signing_key_id,
            witness_refs: draft.witness_refs,
        }
    }

    pub fn signable_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        signable_bytes(
            self.sequence,
            self.event_type,
            &self.timestamp,
            self.payload_version,
            &self.payload,
            &self.previous_hash,
        )
    }

    pub fn compute_content_hash(&self) -> Result<ContentHash, serde_json::Error> {
        Ok(ContentHash::hash(&self.signable_bytes()?))
    }

    /// Recompute the content hash and compare it with the stored one. An
    /// event whose payload cannot be encoded never verifies.
    pub fn verify_content_hash(&self) -> bool {
        matches!(self.compute_content_hash(), Ok(hash) if hash == self.content_hash)
    }

    /// The head this event establishes once committed.
    pub fn as_head(&self) -> LedgerHead {
        LedgerHead {
            sequence: self.sequence,
            hash: self.content_hash,
        }
    }
}

/// The tip of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerHead {
    pub sequence: u64,
    pub hash: ContentHash,
}

impl LedgerHead {
    /// Head of an empty ledger.
    pub const fn genesis() -> Self {
        Self {
            sequence: 0,
            hash: ContentHash::zero(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 0
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence + 1
    }
}

impl Default for LedgerHead {
    fn default() -> Self {
        Self::genesis()
    }
}

impl std::fmt::Display for LedgerHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.sequence, self.hash)
    }
}
