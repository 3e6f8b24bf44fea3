//! The two halt channels.
//!
//! The fast channel is an in-process broadcast every check reads. The
//! durable flag survives restarts and is what other processes poll. The
//! system is halted when either one says so.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::error::HaltError;
use crate::state::HaltState;

/// Low-latency halt propagation.
pub trait FastChannel: Send + Sync {
    fn publish(&self, state: HaltState) -> Result<(), HaltError>;

    /// Current state, or `ChannelUnavailable` when the channel cannot be read.
    fn current(&self) -> Result<HaltState, HaltError>;
}

/// `tokio::sync::watch` fast channel for a single process.
pub struct WatchChannel {
    tx: watch::Sender<HaltState>,
}

impl WatchChannel {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HaltState::Running);
        Self { tx }
    }

    pub fn watch(&self) -> watch::Receiver<HaltState> {
        self.tx.subscribe()
    }
}

impl Default for WatchChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FastChannel for WatchChannel {
    fn publish(&self, state: HaltState) -> Result<(), HaltError> {
        self.tx.send_replace(state);
        Ok(())
    }

    fn current(&self) -> Result<HaltState, HaltError> {
        Ok(self.tx.borrow().clone())
    }
}

/// Restart-surviving halt flag.
#[async_trait]
pub trait DurableFlag: Send + Sync {
    async fn load(&self) -> Result<HaltState, HaltError>;

    /// Must be durable before returning.
    async fn store(&self, state: &HaltState) -> Result<(), HaltError>;
}

#[derive(Default)]
pub struct MemoryFlag {
    state: RwLock<HaltState>,
}

impl MemoryFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableFlag for MemoryFlag {
    async fn load(&self) -> Result<HaltState, HaltError> {
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn store(&self, state: &HaltState) -> Result<(), HaltError> {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }
}

/// JSON flag file, written to a temp file, fsynced, then renamed over `halt.flag`.
pub struct FileFlag {
    path: PathBuf,
}

impl FileFlag {
    pub const FILE_NAME: &'static str = "halt.flag";

    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, HaltError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self {
            path: data_dir.as_ref().join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DurableFlag for FileFlag {
    async fn load(&self) -> Result<HaltState, HaltError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HaltState::Running),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, state), fields(halted = state.is_halted()))]
    async fn store(&self, state: &HaltState) -> Result<(), HaltError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), HaltError> {
            use std::io::Write;
            let tmp = path.with_extension("flag.tmp");
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            if let Some(dir) = path.parent() {
                // Persist the rename itself.
                if let Ok(dir) = std::fs::File::open(dir) {
                    let _ = dir.sync_all();
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| HaltError::Flag(format!("flag writer task failed: {e}")))??;
        debug!(path = %self.path.display(), "Durable halt flag written");
        Ok(())
    }
}
