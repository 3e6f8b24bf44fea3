//! Key custody behind the [`SigningService`] seam.
//!
//! Production custody (HSM, remote signer) plugs in behind the trait; the
//! software implementation keeps Ed25519 keys in memory and is meant for
//! development and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use conclave_types::{KeyId, SignatureBytes};
use ed25519_dalek::SigningKey;
use tracing::{debug, info};

use crate::crypto;
use crate::error::SigningError;

/// Signs on behalf of the ledger writer with whichever key is currently active.
#[async_trait]
pub trait SigningService: Send + Sync {
    /// The key new signatures are made with.
    fn active_key_id(&self) -> KeyId;

    /// Sign `message` with the active key.
    async fn sign(&self, message: &[u8]) -> Result<(SignatureBytes, KeyId), SigningError>;

    /// Switch the active key. The custody must already hold it.
    async fn activate(&self, key_id: &KeyId) -> Result<(), SigningError>;

    /// Hex public key for a key held in custody.
    fn public_key(&self, key_id: &KeyId) -> Result<String, SigningError>;
}

/// In-memory Ed25519 key custody.
pub struct SoftwareKeyCustody {
    keys: RwLock<HashMap<KeyId, SigningKey>>,
    active: RwLock<KeyId>,
}

impl SoftwareKeyCustody {
    pub fn new(key_id: KeyId, signing_key: SigningKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), signing_key);
        Self {
            keys: RwLock::new(keys),
            active: RwLock::new(key_id),
        }
    }

    /// Custody with a freshly generated key.
    pub fn generate(key_id: KeyId) -> Self {
        Self::new(key_id, crypto::generate_signing_key())
    }

    /// Take custody of an additional key (e.g. a rotation successor) without activating it.
    pub fn install(&self, key_id: KeyId, signing_key: SigningKey) {
        debug!(key_id = %key_id, "Installing key into custody");
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id, signing_key);
    }

    /// Generate and install a successor key, returning its public key.
    pub fn prepare_successor(&self, key_id: KeyId) -> String {
        let key = crypto::generate_signing_key();
        let public = crypto::public_key_hex(&key.verifying_key());
        self.install(key_id, key);
        public
    }

    /// Sign with a specific key held in custody.
    pub fn sign_as(&self, key_id: &KeyId, message: &[u8]) -> Result<SignatureBytes, SigningError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let key = keys
            .get(key_id)
            .ok_or_else(|| SigningError::NotInCustody(key_id.clone()))?;
        Ok(crypto::sign_with(key, message))
    }
}

impl std::fmt::Debug for SoftwareKeyCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeyCustody")
            .field("active", &self.active_key_id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SigningService for SoftwareKeyCustody {
    fn active_key_id(&self) -> KeyId {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn sign(&self, message: &[u8]) -> Result<(SignatureBytes, KeyId), SigningError> {
        let key_id = self.active_key_id();
        let signature = self.sign_as(&key_id, message)?;
        Ok((signature, key_id))
    }

    async fn activate(&self, key_id: &KeyId) -> Result<(), SigningError> {
        if !self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key_id)
        {
            return Err(SigningError::NotInCustody(key_id.clone()));
        }
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = key_id.clone();
        info!(key_id = %key_id, "Active signing key switched");
        Ok(())
    }

    fn public_key(&self, key_id: &KeyId) -> Result<String, SigningError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(key_id)
            .map(|k| crypto::public_key_hex(&k.verifying_key()))
            .ok_or_else(|| SigningError::NotInCustody(key_id.clone()))
    }
}
