//! Immutable bundle storage.
//!
//! Bundles are stored as the exact bytes produced at build time and served
//! back unchanged. There is no overwrite and no delete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conclave_types::BundleId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ContextError, ContextResult};

#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Store `bytes` under `bundle_id`. Fails with `BundleExists` if the id is taken.
    async fn put(&self, bundle_id: BundleId, bytes: Vec<u8>) -> ContextResult<()>;

    async fn get(&self, bundle_id: &BundleId) -> ContextResult<Option<Arc<[u8]>>>;
}

#[derive(Default)]
pub struct MemoryBundleStore {
    bundles: DashMap<BundleId, Arc<[u8]>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn put(&self, bundle_id: BundleId, bytes: Vec<u8>) -> ContextResult<()> {
        match self.bundles.entry(bundle_id) {
            Entry::Occupied(_) => Err(ContextError::BundleExists(bundle_id)),
            Entry::Vacant(slot) => {
                slot.insert(bytes.into());
                Ok(())
            }
        }
    }

    async fn get(&self, bundle_id: &BundleId) -> ContextResult<Option<Arc<[u8]>>> {
        Ok(self.bundles.get(bundle_id).map(|b| Arc::clone(b.value())))
    }
}

/// One `bundle-<uuid>.json` file per bundle, created exclusively and synced.
pub struct FileBundleStore {
    dir: PathBuf,
}

impl FileBundleStore {
    pub async fn open(dir: impl AsRef<Path>) -> ContextResult<Self> {
        tokio::fs::create_dir_all(dir.as_ref()).await?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path(&self, bundle_id: &BundleId) -> PathBuf {
        self.dir.join(format!("bundle-{}.json", bundle_id.0))
    }
}

#[async_trait]
impl BundleStore for FileBundleStore {
    async fn put(&self, bundle_id: BundleId, bytes: Vec<u8>) -> ContextResult<()> {
        let path = self.path(&bundle_id);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ContextError::BundleExists(bundle_id))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        debug!(bundle_id = %bundle_id, path = %path.display(), "Bundle written");
        Ok(())
    }

    async fn get(&self, bundle_id: &BundleId) -> ContextResult<Option<Arc<[u8]>>> {
        match tokio::fs::read(self.path(bundle_id)).await {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
