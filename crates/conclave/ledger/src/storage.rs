//! Event storage backends.
//!
//! [`EventStorage`] is insert-and-read only. Each backend runs every insert
//! through [`check_insert`], so a broken link, a missing field or a second
//! write to an existing sequence is refused at the storage boundary no matter
//! who calls it.

use std::path::PathBuf;

use async_trait::async_trait;
use conclave_types::Event;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::error::LedgerError;
use crate::wal::{MemoryStorage, WalConfig, WalIntegrityReport, WalStorage, WriteAheadLog};

/// Append-only event table. There is no update or delete.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Durably insert the next event of the chain.
    async fn insert(&self, event: &Event) -> Result<(), LedgerError>;

    async fn get(&self, sequence: u64) -> Result<Option<Event>, LedgerError>;

    /// Events with `from <= sequence <= to`.
    async fn range(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError>;

    async fn last(&self) -> Result<Option<Event>, LedgerError>;

    /// CRC-level report for backends that have one.
    async fn wal_report(&self) -> Result<Option<WalIntegrityReport>, LedgerError> {
        Ok(None)
    }
}

/// Structural checks every backend applies before persisting `event` after `last`.
pub fn check_insert(last: Option<&Event>, event: &Event) -> Result<(), LedgerError> {
    if event.signature.is_empty() {
        return Err(LedgerError::MissingField("signature"));
    }
    if event.signing_key_id.0.is_empty() {
        return Err(LedgerError::MissingField("signing_key_id"));
    }
    if event.event_type != event.payload.event_type() {
        return Err(LedgerError::SchemaViolation {
            event_type: event.event_type,
            reason: "event type does not match payload".into(),
        });
    }
    if !event.verify_content_hash() {
        return Err(LedgerError::ContentHashMismatch {
            sequence: event.sequence,
        });
    }

    let (expected_sequence, expected_previous) = match last {
        Some(last) => (last.sequence + 1, last.content_hash),
        None => (1, conclave_types::ContentHash::zero()),
    };
    if event.sequence < expected_sequence {
        return Err(LedgerError::ImmutabilityViolation {
            sequence: event.sequence,
        });
    }
    if event.sequence != expected_sequence {
        return Err(LedgerError::BrokenChain {
            sequence: event.sequence,
            reason: format!("expected sequence {expected_sequence}"),
        });
    }
    if event.previous_hash != expected_previous {
        return Err(LedgerError::BrokenChain {
            sequence: event.sequence,
            reason: format!("previous hash does not match {expected_previous}"),
        });
    }
    Ok(())
}

fn slice_range(events: &[Event], from: u64, to: u64) -> Vec<Event> {
    if from == 0 || from > to {
        return Vec::new();
    }
    let start = (from - 1) as usize;
    let end = (to as usize).min(events.len());
    if start >= end {
        return Vec::new();
    }
    events[start..end].to_vec()
}

// ---- In-memory backend ----

/// In-memory event table, for tests and development.
#[derive(Default)]
pub struct MemoryEventStorage {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStorage for MemoryEventStorage {
    async fn insert(&self, event: &Event) -> Result<(), LedgerError> {
        let mut events = self.events.write().await;
        check_insert(events.last(), event)?;
        events.push(event.clone());
        Ok(())
    }

    async fn get(&self, sequence: u64) -> Result<Option<Event>, LedgerError> {
        if sequence == 0 {
            return Ok(None);
        }
        Ok(self.events.read().await.get((sequence - 1) as usize).cloned())
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        Ok(slice_range(&self.events.read().await, from, to))
    }

    async fn last(&self) -> Result<Option<Event>, LedgerError> {
        Ok(self.events.read().await.last().cloned())
    }
}

// ---- WAL backend ----

/// WAL-backed event table. Entries are JSON-encoded events; the decoded
/// chain is held in memory for reads and re-verified structurally on open.
pub struct WalEventStorage {
    wal: WriteAheadLog,
    events: RwLock<Vec<Event>>,
}

impl WalEventStorage {
    #[instrument(skip(config, storage))]
    pub async fn open(config: WalConfig, storage: Box<dyn WalStorage>) -> Result<Self, LedgerError> {
        let wal = WriteAheadLog::open(config, storage).await?;
        let mut events: Vec<Event> = Vec::new();
        for entry in wal.read_all().await? {
            let event: Event = serde_json::from_slice(&entry.bytes)?;
            if event.sequence != entry.sequence {
                return Err(LedgerError::BrokenChain {
                    sequence: entry.sequence,
                    reason: format!("frame sequence differs from event #{}", event.sequence),
                });
            }
            check_insert(events.last(), &event)?;
            events.push(event);
        }
        info!(events = events.len(), "Event WAL recovered");
        Ok(Self {
            wal,
            events: RwLock::new(events),
        })
    }

    pub async fn open_dir(config: WalConfig, data_dir: PathBuf) -> Result<Self, LedgerError> {
        let storage = Box::new(crate::wal::FileStorage::new(data_dir)?);
        Self::open(config, storage).await
    }

    pub async fn open_memory(config: WalConfig, storage: MemoryStorage) -> Result<Self, LedgerError> {
        Self::open(config, Box::new(storage)).await
    }
}

#[async_trait]
impl EventStorage for WalEventStorage {
    async fn insert(&self, event: &Event) -> Result<(), LedgerError> {
        let mut events = self.events.write().await;
        check_insert(events.last(), event)?;
        let bytes = serde_json::to_vec(event)?;
        // Visible only once durable.
        self.wal.append(event.sequence, &bytes).await?;
        events.push(event.clone());
        Ok(())
    }

    async fn get(&self, sequence: u64) -> Result<Option<Event>, LedgerError> {
        if sequence == 0 {
            return Ok(None);
        }
        Ok(self.events.read().await.get((sequence - 1) as usize).cloned())
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        Ok(slice_range(&self.events.read().await, from, to))
    }

    async fn last(&self) -> Result<Option<Event>, LedgerError> {
        Ok(self.events.read().await.last().cloned())
    }

    async fn wal_report(&self) -> Result<Option<WalIntegrityReport>, LedgerError> {
        Ok(Some(self.wal.verify_integrity().await?))
    }
}
