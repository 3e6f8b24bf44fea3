use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::KeyId;

/// Lifecycle status of a signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    Active,
    /// Superseded by a rotation but still inside its overlap window.
    Rotating,
    Revoked,
}

/// Registry entry for a signing key. Public material only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    pub status: KeyStatus,
    pub activated_at: DateTime<Utc>,
    /// Set once the key enters `Rotating`; revocation happens after the overlap window.
    pub rotation_started_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn active(key_id: KeyId, public_key: String, activated_at: DateTime<Utc>) -> Self {
        Self {
            key_id,
            public_key,
            status: KeyStatus::Active,
            activated_at,
            rotation_started_at: None,
            revoked_at: None,
        }
    }

    /// Whether a signature made at `at` with this key is acceptable.
    ///
    /// A revoked key still verifies history signed before its revocation.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        if at < self.activated_at {
            return false;
        }
        match self.revoked_at {
            Some(revoked) => at < revoked,
            None => true,
        }
    }

    /// Whether this key may sign new content right now.
    pub fn may_sign(&self) -> bool {
        matches!(self.status, KeyStatus::Active | KeyStatus::Rotating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn revoked_key_verifies_history_only() {
        let t0 = Utc::now();
        let mut record = KeyRecord::active(KeyId::new("k1"), "00".repeat(32), t0);
        assert!(record.valid_at(t0 + Duration::minutes(5)));

        record.status = KeyStatus::Revoked;
        record.revoked_at = Some(t0 + Duration::hours(1));
        assert!(record.valid_at(t0 + Duration::minutes(5)));
        assert!(!record.valid_at(t0 + Duration::hours(2)));
        assert!(!record.may_sign());
    }

    #[test]
    fn signature_before_activation_is_invalid() {
        let t0 = Utc::now();
        let record = KeyRecord::active(KeyId::new("k1"), "00".repeat(32), t0);
        assert!(!record.valid_at(t0 - Duration::seconds(1)));
    }
}
