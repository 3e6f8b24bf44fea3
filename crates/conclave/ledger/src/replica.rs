//! Read-only replica that follows the canonical writer.
//!
//! The replica re-verifies every hash, link and signature it receives. It
//! never reconciles: a divergence, a bad event or excessive lag is reported to
//! the [`FaultSink`] and the replica stops following until an operator
//! rebuilds it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_signing::SignatureVerifier;
use conclave_types::{Event, LedgerHead, SharedClock, SourceId};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::anomaly::{FaultKind, FaultReport, FaultSink};
use crate::error::LedgerError;
use crate::storage::{EventStorage, MemoryEventStorage};
use crate::store::LedgerSource;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Events behind the writer before lag is treated as a fault.
    pub max_lag_events: u64,
    /// Events fetched per read.
    pub batch_size: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_lag_events: 1_000,
            batch_size: 256,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub replica_id: SourceId,
    pub local_head: LedgerHead,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub faulted: Option<String>,
}

pub struct LedgerReplica {
    id: SourceId,
    config: ReplicaConfig,
    source: Arc<dyn LedgerSource>,
    verifier: Arc<dyn SignatureVerifier>,
    local: MemoryEventStorage,
    sink: Arc<dyn FaultSink>,
    clock: SharedClock,
    sync_lock: Mutex<()>,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
    faulted: RwLock<Option<String>>,
}

impl LedgerReplica {
    pub fn new(
        id: SourceId,
        config: ReplicaConfig,
        source: Arc<dyn LedgerSource>,
        verifier: Arc<dyn SignatureVerifier>,
        sink: Arc<dyn FaultSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            id,
            config,
            source,
            verifier,
            local: MemoryEventStorage::new(),
            sink,
            clock,
            sync_lock: Mutex::new(()),
            last_sync_at: RwLock::new(None),
            faulted: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub async fn head(&self) -> LedgerHead {
        match self.local.last().await {
            Ok(Some(event)) => event.as_head(),
            _ => LedgerHead::genesis(),
        }
    }

    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read().await
    }

    pub async fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            replica_id: self.id.clone(),
            local_head: self.head().await,
            last_sync_at: self.last_sync_at().await,
            faulted: self.faulted.read().await.clone(),
        }
    }

    /// Pull and verify everything the writer has that this replica lacks.
    /// Returns the number of events accepted.
    pub async fn sync_once(&self) -> Result<u64, LedgerError> {
        let _sync = self.sync_lock.lock().await;
        if let Some(reason) = self.faulted.read().await.clone() {
            return Err(LedgerError::ReplicaDivergence {
                sequence: self.head().await.sequence,
                detail: format!("replica halted after fault: {reason}"),
            });
        }

        let remote = self.source.head().await?;
        let local = self.head().await;

        if remote.sequence < local.sequence {
            let detail = format!("writer head #{} is behind replica head #{}", remote.sequence, local.sequence);
            return Err(self.fault(FaultKind::ReplicaDivergence, remote.sequence, detail).await);
        }
        if !local.is_genesis() {
            let shared = self.source.read(local.sequence, local.sequence).await?;
            match shared.first() {
                Some(event) if event.content_hash == local.hash => {}
                Some(event) => {
                    let detail = format!("writer has {} where replica has {}", event.content_hash, local.hash);
                    return Err(self.fault(FaultKind::ReplicaDivergence, local.sequence, detail).await);
                }
                None => {
                    let detail = "writer no longer serves a sequence the replica holds".to_string();
                    return Err(self.fault(FaultKind::ReplicaDivergence, local.sequence, detail).await);
                }
            }
        }

        let lag = remote.sequence - local.sequence;
        if lag > self.config.max_lag_events {
            let detail = format!("{lag} events behind (limit {})", self.config.max_lag_events);
            self.sink
                .report(FaultReport {
                    kind: FaultKind::ReplicaLag,
                    source: self.id.clone(),
                    sequence: Some(local.sequence),
                    detail,
                    detected_at: self.clock.now(),
                })
                .await;
        }

        let mut accepted = 0u64;
        let mut next = local.sequence + 1;
        while next <= remote.sequence {
            let to = (next + self.config.batch_size.max(1) - 1).min(remote.sequence);
            let batch = self.source.read(next, to).await?;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                if let Err(detail) = self.accept(&event).await {
                    return Err(self
                        .fault(FaultKind::ReplicaVerificationFailed, event.sequence, detail)
                        .await);
                }
                accepted += 1;
                next = event.sequence + 1;
            }
        }

        *self.last_sync_at.write().await = Some(self.clock.now());
        if accepted > 0 {
            debug!(replica = %self.id, accepted, head = %self.head().await, "Replica caught up");
        }
        Ok(accepted)
    }

    async fn accept(&self, event: &Event) -> Result<(), String> {
        self.verifier
            .verify_event(event)
            .map_err(|e| format!("signature: {e}"))?;
        self.verifier
            .verify_witnesses(event)
            .map_err(|e| format!("witness: {e}"))?;
        // Chain link and content hash are checked by the storage boundary.
        self.local.insert(event).await.map_err(|e| e.to_string())?;
        self.verifier
            .on_committed(event)
            .map_err(|e| format!("key lifecycle: {e}"))
    }

    async fn fault(&self, kind: FaultKind, sequence: u64, detail: String) -> LedgerError {
        error!(replica = %self.id, %kind, sequence, %detail, "Replica fault");
        *self.faulted.write().await = Some(format!("{kind}: {detail}"));
        self.sink
            .report(FaultReport {
                kind,
                source: self.id.clone(),
                sequence: Some(sequence),
                detail: detail.clone(),
                detected_at: self.clock.now(),
            })
            .await;
        LedgerError::ReplicaDivergence { sequence, detail }
    }

    /// Follow the writer until `shutdown` flips to `true` or a fault stops the replica.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.poll_interval_ms));
        info!(replica = %self.id, "Replica follower started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(_) => {}
                        Err(LedgerError::ReplicaDivergence { .. }) => break,
                        Err(e) => warn!(replica = %self.id, error = %e, "Replica sync failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(replica = %self.id, "Replica follower stopped");
    }
}

#[async_trait]
impl LedgerSource for LedgerReplica {
    async fn head(&self) -> Result<LedgerHead, LedgerError> {
        Ok(LedgerReplica::head(self).await)
    }

    async fn read(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        self.local.range(from, to).await
    }
}
