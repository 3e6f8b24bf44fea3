//! Public-key registry with rotation overlap windows.
//!
//! The registry never holds private material. It is reconstructed from
//! `KeyActivated` / `KeyRevoked` events on startup and is the verifier the
//! ledger checks every signature against.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use conclave_types::{
    witness_message, Event, EventPayload, KeyId, KeyRecord, KeyStatus, SignatureBytes,
};
use tracing::{info, warn};

use crate::crypto;
use crate::error::SigningError;

/// Verifies a signature made by a registered key at a given instant.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        key_id: &KeyId,
        message: &[u8],
        signature: &SignatureBytes,
        signed_at: DateTime<Utc>,
    ) -> Result<(), SigningError>;

    /// Verify the writer signature of a committed event.
    fn verify_event(&self, event: &Event) -> Result<(), SigningError> {
        let message = event
            .signable_bytes()
            .map_err(|e| SigningError::Unencodable(e.to_string()))?;
        self.verify(
            &event.signing_key_id,
            &message,
            &event.signature,
            event.timestamp,
        )
    }

    /// Verify every witness co-signature of a committed event.
    fn verify_witnesses(&self, event: &Event) -> Result<(), SigningError> {
        let message = witness_message(&event.content_hash);
        for witness in &event.witness_refs {
            self.verify(
                &witness.witness_key_id,
                &message,
                &witness.signature,
                event.timestamp,
            )?;
        }
        Ok(())
    }

    /// Whether [`SignatureVerifier::on_committed`] would accept `event`,
    /// without applying it.
    fn check_committable(&self, _event: &Event) -> Result<(), SigningError> {
        Ok(())
    }

    /// Called after an event commits. Verifiers that track key lifecycle
    /// fold `KeyActivated` / `KeyRevoked` in here.
    fn on_committed(&self, _event: &Event) -> Result<(), SigningError> {
        Ok(())
    }
}

/// A rotation that has passed its overlap window and was revoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedRotation {
    pub key_id: KeyId,
    pub revoked_at: DateTime<Utc>,
}

pub struct KeyRegistry {
    records: RwLock<HashMap<KeyId, KeyRecord>>,
    overlap: Duration,
}

impl KeyRegistry {
    pub fn new(overlap: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            overlap,
        }
    }

    pub fn overlap(&self) -> Duration {
        self.overlap
    }

    /// Register a trust-anchor key as active. Idempotent for identical material.
    pub fn register_active(
        &self,
        key_id: KeyId,
        public_key: String,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord, SigningError> {
        crypto::parse_public_key(&public_key)?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = records.get_mut(&key_id) {
            if existing.public_key != public_key {
                return Err(SigningError::KeyConflict(key_id));
            }
            existing.activated_at = existing.activated_at.min(at);
            return Ok(existing.clone());
        }
        let record = KeyRecord::active(key_id.clone(), public_key, at);
        records.insert(key_id.clone(), record.clone());
        info!(key_id = %key_id, "Registered active key");
        Ok(record)
    }

    /// Register an out-of-band trust anchor. Anchors verify history from any point in time.
    pub fn register_trust_anchor(
        &self,
        key_id: KeyId,
        public_key: String,
    ) -> Result<KeyRecord, SigningError> {
        self.register_active(key_id, public_key, DateTime::<Utc>::MIN_UTC)
    }

    /// Move `retiring` to ROTATING and activate `successor`.
    ///
    /// The retiring key keeps verifying until [`KeyRegistry::finalize_rotations`]
    /// revokes it after the overlap window.
    pub fn begin_rotation(
        &self,
        retiring: &KeyId,
        successor: KeyId,
        successor_public_key: String,
        at: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        crypto::parse_public_key(&successor_public_key)?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if check_rotation(&records, retiring, &successor, &successor_public_key)? {
            return Ok(());
        }

        if let Some(old) = records.get_mut(retiring) {
            old.status = KeyStatus::Rotating;
            old.rotation_started_at = Some(at);
        }
        records.insert(
            successor.clone(),
            KeyRecord::active(successor.clone(), successor_public_key, at),
        );
        info!(retiring = %retiring, successor = %successor, "Key rotation started");
        Ok(())
    }

    /// Revoke every ROTATING key whose overlap window has elapsed.
    pub fn finalize_rotations(&self, now: DateTime<Utc>) -> Vec<FinalizedRotation> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let mut finalized = Vec::new();
        for record in records.values_mut() {
            if record.status != KeyStatus::Rotating {
                continue;
            }
            let Some(started) = record.rotation_started_at else {
                continue;
            };
            if now >= started + self.overlap {
                record.status = KeyStatus::Revoked;
                record.revoked_at = Some(now);
                finalized.push(FinalizedRotation {
                    key_id: record.key_id.clone(),
                    revoked_at: now,
                });
                info!(key_id = %record.key_id, "Rotated key revoked after overlap window");
            }
        }
        finalized
    }

    /// Immediate revocation, e.g. on suspected compromise.
    pub fn revoke(&self, key_id: &KeyId, at: DateTime<Utc>) -> Result<(), SigningError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(key_id)
            .ok_or_else(|| SigningError::UnknownKey(key_id.clone()))?;
        if record.status == KeyStatus::Revoked {
            return Ok(());
        }
        record.status = KeyStatus::Revoked;
        record.revoked_at = Some(at);
        warn!(key_id = %key_id, "Key revoked");
        Ok(())
    }

    /// Fold a committed key lifecycle event into the registry.
    pub fn apply_event(&self, event: &Event) -> Result<(), SigningError> {
        match &event.payload {
            EventPayload::KeyActivated {
                key_id,
                public_key,
                supersedes,
                ..
            } => match supersedes {
                Some(retiring) => {
                    self.begin_rotation(retiring, key_id.clone(), public_key.clone(), event.timestamp)
                }
                None => self
                    .register_active(key_id.clone(), public_key.clone(), event.timestamp)
                    .map(|_| ()),
            },
            EventPayload::KeyRevoked { key_id, .. } => self.revoke(key_id, event.timestamp),
            _ => Ok(()),
        }
    }

    pub fn get(&self, key_id: &KeyId) -> Option<KeyRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key_id)
            .cloned()
    }

    pub fn records(&self) -> Vec<KeyRecord> {
        let mut all: Vec<KeyRecord> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.activated_at.cmp(&b.activated_at).then(a.key_id.cmp(&b.key_id)));
        all
    }

    pub fn active_keys(&self) -> Vec<KeyId> {
        self.records()
            .into_iter()
            .filter(|r| r.status == KeyStatus::Active)
            .map(|r| r.key_id)
            .collect()
    }
}

/// Validate a rotation against `records`. `Ok(true)` if it was already applied.
fn check_rotation(
    records: &HashMap<KeyId, KeyRecord>,
    retiring: &KeyId,
    successor: &KeyId,
    successor_public_key: &str,
) -> Result<bool, SigningError> {
    // Re-running an executed rotation is a no-op.
    if let (Some(old), Some(new)) = (records.get(retiring), records.get(successor)) {
        if old.status != KeyStatus::Active && new.public_key == successor_public_key {
            return Ok(true);
        }
    }
    let old = records
        .get(retiring)
        .ok_or_else(|| SigningError::UnknownKey(retiring.clone()))?;
    if old.status != KeyStatus::Active {
        return Err(SigningError::InvalidKeyState {
            key_id: retiring.clone(),
            expected: KeyStatus::Active,
            actual: old.status,
        });
    }
    if let Some(existing) = records.get(successor) {
        if existing.public_key != successor_public_key {
            return Err(SigningError::KeyConflict(successor.clone()));
        }
    }
    Ok(false)
}

impl SignatureVerifier for KeyRegistry {
    fn verify(
        &self,
        key_id: &KeyId,
        message: &[u8],
        signature: &SignatureBytes,
        signed_at: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        let record = self
            .get(key_id)
            .ok_or_else(|| SigningError::UnknownKey(key_id.clone()))?;
        if !record.valid_at(signed_at) {
            return Err(if record.status == KeyStatus::Revoked {
                SigningError::KeyRevoked(key_id.clone())
            } else {
                SigningError::KeyNotValidAt {
                    key_id: key_id.clone(),
                    at: signed_at,
                }
            });
        }
        let public = crypto::parse_public_key(&record.public_key)?;
        crypto::verify_with(&public, message, signature)
            .map_err(|_| SigningError::InvalidSignature(key_id.clone()))
    }

    fn check_committable(&self, event: &Event) -> Result<(), SigningError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        match &event.payload {
            EventPayload::KeyActivated {
                key_id,
                public_key,
                supersedes,
                ..
            } => {
                crypto::parse_public_key(public_key)?;
                match supersedes {
                    Some(retiring) => check_rotation(&records, retiring, key_id, public_key).map(|_| ()),
                    None => match records.get(key_id) {
                        Some(existing) if existing.public_key != *public_key => {
                            Err(SigningError::KeyConflict(key_id.clone()))
                        }
                        _ => Ok(()),
                    },
                }
            }
            EventPayload::KeyRevoked { key_id, .. } if !records.contains_key(key_id) => {
                Err(SigningError::UnknownKey(key_id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn on_committed(&self, event: &Event) -> Result<(), SigningError> {
        self.apply_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{SigningService, SoftwareKeyCustody};

    fn registry_with(custody: &SoftwareKeyCustody, at: DateTime<Utc>) -> KeyRegistry {
        let registry = KeyRegistry::new(Duration::hours(1));
        let key_id = custody.active_key_id();
        registry
            .register_active(key_id.clone(), custody.public_key(&key_id).unwrap(), at)
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn verifies_active_key_signatures() {
        let t0 = Utc::now();
        let custody = SoftwareKeyCustody::generate(KeyId::new("w1"));
        let registry = registry_with(&custody, t0);

        let (sig, key_id) = custody.sign(b"msg").await.unwrap();
        assert!(registry.verify(&key_id, b"msg", &sig, t0).is_ok());
        assert!(matches!(
            registry.verify(&key_id, b"other", &sig, t0),
            Err(SigningError::InvalidSignature(_))
        ));
        assert!(matches!(
            registry.verify(&KeyId::new("nobody"), b"msg", &sig, t0),
            Err(SigningError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn rotation_overlap_then_revocation() {
        let t0 = Utc::now();
        let custody = SoftwareKeyCustody::generate(KeyId::new("w1"));
        let registry = registry_with(&custody, t0);
        let successor_pub = custody.prepare_successor(KeyId::new("w2"));

        registry
            .begin_rotation(&KeyId::new("w1"), KeyId::new("w2"), successor_pub, t0)
            .unwrap();
        assert_eq!(registry.get(&KeyId::new("w1")).unwrap().status, KeyStatus::Rotating);
        assert_eq!(registry.active_keys(), vec![KeyId::new("w2")]);

        // Still verifies inside the overlap window.
        let old_sig = custody.sign_as(&KeyId::new("w1"), b"late").unwrap();
        let during = t0 + Duration::minutes(30);
        assert!(registry.verify(&KeyId::new("w1"), b"late", &old_sig, during).is_ok());

        assert!(registry.finalize_rotations(during).is_empty());
        let revoked_at = t0 + Duration::hours(2);
        let finalized = registry.finalize_rotations(revoked_at);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].key_id, KeyId::new("w1"));

        // History stays verifiable, new signatures do not.
        assert!(registry.verify(&KeyId::new("w1"), b"late", &old_sig, during).is_ok());
        assert!(matches!(
            registry.verify(&KeyId::new("w1"), b"late", &old_sig, revoked_at + Duration::seconds(1)),
            Err(SigningError::KeyRevoked(_))
        ));
    }

    #[test]
    fn rotation_requires_active_predecessor() {
        let t0 = Utc::now();
        let custody = SoftwareKeyCustody::generate(KeyId::new("w1"));
        let registry = registry_with(&custody, t0);
        registry.revoke(&KeyId::new("w1"), t0).unwrap();

        let successor_pub = custody.prepare_successor(KeyId::new("w2"));
        assert!(matches!(
            registry.begin_rotation(&KeyId::new("w1"), KeyId::new("w2"), successor_pub, t0),
            Err(SigningError::InvalidKeyState { .. })
        ));
    }

    #[test]
    fn conflicting_material_is_rejected() {
        let t0 = Utc::now();
        let custody = SoftwareKeyCustody::generate(KeyId::new("w1"));
        let registry = registry_with(&custody, t0);
        let other = crypto::public_key_hex(&crypto::generate_signing_key().verifying_key());
        assert!(matches!(
            registry.register_active(KeyId::new("w1"), other, t0),
            Err(SigningError::KeyConflict(_))
        ));
    }
}
