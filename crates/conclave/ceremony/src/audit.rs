//! The ceremony prepare log.
//!
//! Every request, approval and transition is written here, signed and
//! hash-chained, before anything acts on it. Recovery rebuilds ceremonies
//! from this log alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_signing::{SignatureVerifier, SigningService};
use conclave_types::{
    CeremonyId, CeremonyState, CeremonyType, ContentHash, KeyId, SharedClock, SignatureBytes,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::approval::SignedApproval;
use crate::ceremony::Ceremony;
use crate::error::{CeremonyError, CeremonyResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    /// The ceremony as created, in `PENDING`.
    Requested { ceremony: Box<Ceremony> },
    Approval { approval: SignedApproval },
    Transition {
        from: CeremonyState,
        to: CeremonyState,
        detail: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub index: u64,
    pub ceremony_id: CeremonyId,
    pub ceremony_type: CeremonyType,
    pub entry: AuditEntry,
    pub recorded_at: DateTime<Utc>,
    pub previous_hash: ContentHash,
    pub record_hash: ContentHash,
    pub signing_key_id: KeyId,
    pub signature: SignatureBytes,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    index: u64,
    ceremony_id: &'a CeremonyId,
    ceremony_type: CeremonyType,
    entry: &'a AuditEntry,
    recorded_at: &'a DateTime<Utc>,
    previous_hash: &'a ContentHash,
}

fn record_hash(body: &RecordBody<'_>) -> CeremonyResult<ContentHash> {
    let mut bytes = b"conclave-audit-v1:".to_vec();
    bytes.extend_from_slice(&serde_json::to_vec(body)?);
    Ok(ContentHash::hash(&bytes))
}

impl AuditRecord {
    pub fn compute_hash(&self) -> CeremonyResult<ContentHash> {
        record_hash(&RecordBody {
            index: self.index,
            ceremony_id: &self.ceremony_id,
            ceremony_type: self.ceremony_type,
            entry: &self.entry,
            recorded_at: &self.recorded_at,
            previous_hash: &self.previous_hash,
        })
    }

    /// `(from, to)` if this record declares a state change.
    pub fn transition(&self) -> Option<(Option<CeremonyState>, CeremonyState)> {
        match &self.entry {
            AuditEntry::Requested { .. } => Some((None, CeremonyState::Pending)),
            AuditEntry::Transition { from, to, .. } => Some((Some(*from), *to)),
            AuditEntry::Approval { .. } => None,
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────────

/// Append-only persistence for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably append. Must not return before the record would survive a crash.
    async fn append(&self, record: &AuditRecord) -> CeremonyResult<()>;

    async fn load(&self) -> CeremonyResult<Vec<AuditRecord>>;
}

#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> CeremonyResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn load(&self) -> CeremonyResult<Vec<AuditRecord>> {
        Ok(self.records.read().await.clone())
    }
}

/// JSON-lines audit file (`ceremony-audit.jsonl`), synced after every line.
pub struct FileAuditStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileAuditStore {
    pub const FILE_NAME: &'static str = "ceremony-audit.jsonl";

    pub async fn open(data_dir: impl AsRef<Path>) -> CeremonyResult<Self> {
        tokio::fs::create_dir_all(data_dir.as_ref()).await?;
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn append(&self, record: &AuditRecord) -> CeremonyResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self) -> CeremonyResult<Vec<AuditRecord>> {
        let file = self.file.lock().await;
        let text = tokio::fs::read_to_string(&self.path).await?;
        let lines: Vec<&str> = text.split('\n').collect();
        let mut records = Vec::new();
        let mut offset = 0u64;
        for (i, line) in lines.iter().enumerate() {
            let start = offset;
            offset += line.len() as u64 + 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                // Only the final, unterminated line can be a torn write.
                Err(e) if i + 1 == lines.len() => {
                    warn!(error = %e, "Discarding torn trailing audit line");
                    file.set_len(start).await?;
                }
                Err(e) => {
                    return Err(CeremonyError::AuditCorrupted {
                        index: records.len(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

// ── Log ─────────────────────────────────────────────────────────────────

struct Tail {
    next_index: u64,
    last_hash: ContentHash,
}

/// Chains and signs records over an [`AuditStore`].
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    signer: Arc<dyn SigningService>,
    clock: SharedClock,
    tail: Mutex<Tail>,
}

impl AuditLog {
    /// Open over existing records, verifying the hash chain.
    pub async fn open(
        store: Arc<dyn AuditStore>,
        signer: Arc<dyn SigningService>,
        clock: SharedClock,
    ) -> CeremonyResult<Self> {
        let records = store.load().await?;
        verify_chain(&records)?;
        let tail = Tail {
            next_index: records.len() as u64,
            last_hash: records.last().map(|r| r.record_hash).unwrap_or_else(ContentHash::zero),
        };
        info!(records = records.len(), "Ceremony audit log opened");
        Ok(Self {
            store,
            signer,
            clock,
            tail: Mutex::new(tail),
        })
    }

    /// Sign, chain and durably write one entry.
    pub async fn record(&self, ceremony: &Ceremony, entry: AuditEntry) -> CeremonyResult<AuditRecord> {
        let mut tail = self.tail.lock().await;
        let recorded_at = self.clock.now();
        let hash = record_hash(&RecordBody {
            index: tail.next_index,
            ceremony_id: &ceremony.id,
            ceremony_type: ceremony.ceremony_type,
            entry: &entry,
            recorded_at: &recorded_at,
            previous_hash: &tail.last_hash,
        })?;
        let (signature, signing_key_id) = self.signer.sign(hash.as_bytes()).await?;

        let record = AuditRecord {
            index: tail.next_index,
            ceremony_id: ceremony.id,
            ceremony_type: ceremony.ceremony_type,
            entry,
            recorded_at,
            previous_hash: tail.last_hash,
            record_hash: hash,
            signing_key_id,
            signature,
        };
        self.store.append(&record).await?;
        tail.next_index += 1;
        tail.last_hash = hash;
        debug!(ceremony_id = %ceremony.id, index = record.index, "Audit record written");
        Ok(record)
    }

    pub async fn records(&self) -> CeremonyResult<Vec<AuditRecord>> {
        self.store.load().await
    }

    pub async fn trail(&self, ceremony_id: &CeremonyId) -> CeremonyResult<Vec<AuditRecord>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .filter(|r| &r.ceremony_id == ceremony_id)
            .collect())
    }
}

/// Hash and link check across a full record list.
pub fn verify_chain(records: &[AuditRecord]) -> CeremonyResult<()> {
    let mut previous = ContentHash::zero();
    for (i, record) in records.iter().enumerate() {
        let corrupted = |reason: &str| CeremonyError::AuditCorrupted {
            index: i,
            reason: reason.to_string(),
        };
        if record.index != i as u64 {
            return Err(corrupted("index out of order"));
        }
        if record.previous_hash != previous {
            return Err(corrupted("previous hash does not link"));
        }
        if record.compute_hash()? != record.record_hash {
            return Err(corrupted("record hash mismatch"));
        }
        previous = record.record_hash;
    }
    Ok(())
}

/// Signature check against the key registry.
pub fn verify_signatures(records: &[AuditRecord], verifier: &dyn SignatureVerifier) -> CeremonyResult<()> {
    for (i, record) in records.iter().enumerate() {
        verifier
            .verify(
                &record.signing_key_id,
                record.record_hash.as_bytes(),
                &record.signature,
                record.recorded_at,
            )
            .map_err(|e| CeremonyError::AuditCorrupted {
                index: i,
                reason: format!("signature: {e}"),
            })?;
    }
    Ok(())
}
