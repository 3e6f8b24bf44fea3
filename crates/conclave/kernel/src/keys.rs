//! Writer key files.
//!
//! One `<key_id>.key` file per key, holding the hex secret. Only the kernel
//! process reads them; the ledger and registry only ever see public keys.

use std::io::Write;
use std::path::{Path, PathBuf};

use conclave_signing::{crypto, SigningService, SoftwareKeyCustody};
use conclave_types::KeyId;
use ed25519_dalek::SigningKey;
use tracing::{debug, info};

use crate::error::{KernelError, KernelResult};

const KEY_SUFFIX: &str = "key";

pub struct KeyDirectory {
    dir: PathBuf,
}

impl KeyDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.{KEY_SUFFIX}", key_id.0))
    }

    /// Generate a key and write it exclusively. Returns the hex public key.
    pub fn generate(&self, key_id: &KeyId) -> KernelResult<String> {
        std::fs::create_dir_all(&self.dir)?;
        let key = crypto::generate_signing_key();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.file(key_id))
            .map_err(|e| KernelError::KeyFile {
                key_id: key_id.clone(),
                reason: e.to_string(),
            })?;
        file.write_all(crypto::secret_key_hex(&key).as_bytes())?;
        file.sync_all()?;
        info!(key_id = %key_id, dir = %self.dir.display(), "Signing key generated");
        Ok(crypto::public_key_hex(&key.verifying_key()))
    }

    /// Key ids with a file in the directory, sorted.
    pub fn list(&self) -> KernelResult<Vec<KeyId>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_SUFFIX) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(KeyId::new(stem));
            }
        }
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    /// Custody over every key in the directory, with `active` selected.
    pub async fn load_custody(&self, active: &KeyId) -> KernelResult<SoftwareKeyCustody> {
        let missing = || KernelError::KeyFile {
            key_id: active.clone(),
            reason: format!("no key file in {}", self.dir.display()),
        };
        let ids = self.list()?;
        if !ids.contains(active) {
            return Err(missing());
        }
        let custody = SoftwareKeyCustody::new(active.clone(), self.read(active)?);
        for key_id in ids.iter().filter(|id| *id != active) {
            custody.install(key_id.clone(), self.read(key_id)?);
        }
        custody.activate(active).await?;
        debug!(keys = ids.len(), active = %active, "Key custody loaded");
        Ok(custody)
    }

    pub(crate) fn read(&self, key_id: &KeyId) -> KernelResult<SigningKey> {
        let hex = std::fs::read_to_string(self.file(key_id))?;
        crypto::signing_key_from_hex(hex.trim()).map_err(|e| KernelError::KeyFile {
            key_id: key_id.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_keys_load_into_custody() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyDirectory::new(dir.path().join("keys"));
        let first = keys.generate(&KeyId::new("writer-1")).unwrap();
        let second = keys.generate(&KeyId::new("writer-2")).unwrap();
        assert!(matches!(
            keys.generate(&KeyId::new("writer-1")),
            Err(KernelError::KeyFile { .. })
        ));
        assert_eq!(keys.list().unwrap(), vec![KeyId::new("writer-1"), KeyId::new("writer-2")]);

        let custody = keys.load_custody(&KeyId::new("writer-2")).await.unwrap();
        assert_eq!(custody.active_key_id(), KeyId::new("writer-2"));
        assert_eq!(custody.public_key(&KeyId::new("writer-1")).unwrap(), first);
        assert_eq!(custody.public_key(&KeyId::new("writer-2")).unwrap(), second);

        assert!(matches!(
            keys.load_custody(&KeyId::new("writer-9")).await,
            Err(KernelError::KeyFile { .. })
        ));
    }
}
