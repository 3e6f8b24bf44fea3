//! The canonical ledger writer.

use std::sync::Arc;

use async_trait::async_trait;
use conclave_signing::SignatureVerifier;
use conclave_types::{Classified, ContentHash, Event, EventDraft, LedgerHead, SourceId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument};

use crate::anomaly::AnomalyTracker;
use crate::error::LedgerError;
use crate::schema::SchemaRegistry;
use crate::storage::EventStorage;
use crate::wal::WalIntegrityReport;

/// Read side of a ledger, local or remote. Replicas follow one and the
/// watchdog probes one.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    async fn head(&self) -> Result<LedgerHead, LedgerError>;

    /// Events with `from <= sequence <= to`.
    async fn read(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError>;
}

/// Where a chain walk found a problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub sequence: u64,
    pub reason: String,
}

/// Result of re-verifying a range of the chain.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainReport {
    pub from: u64,
    pub to: u64,
    pub checked: u64,
    pub breaks: Vec<ChainBreak>,
    /// Hash of the last event walked.
    pub tip: Option<ContentHash>,
    #[serde(skip)]
    pub wal: Option<WalIntegrityReport>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.breaks.is_empty() && self.wal.as_ref().map(|w| w.is_clean()).unwrap_or(true)
    }
}

/// Single canonical writer over an [`EventStorage`].
///
/// The head lock is held for the whole validate-and-insert step, so two
/// drafts racing on the same observed head cannot both commit.
pub struct LedgerStore {
    storage: Arc<dyn EventStorage>,
    verifier: Arc<dyn SignatureVerifier>,
    schemas: SchemaRegistry,
    head: Mutex<LedgerHead>,
    anomalies: Option<Arc<AnomalyTracker>>,
    committed: broadcast::Sender<Event>,
}

impl LedgerStore {
    /// Open over existing storage, re-verifying every stored event.
    #[instrument(skip_all)]
    pub async fn open(
        storage: Arc<dyn EventStorage>,
        verifier: Arc<dyn SignatureVerifier>,
        schemas: SchemaRegistry,
    ) -> Result<Self, LedgerError> {
        schemas.ensure_complete()?;
        let (committed, _) = broadcast::channel(1024);

        let store = Self {
            storage,
            verifier,
            schemas,
            head: Mutex::new(LedgerHead::genesis()),
            anomalies: None,
            committed,
        };

        let last = store.storage.last().await?;
        let to = last.as_ref().map(|e| e.sequence).unwrap_or(0);
        if to > 0 {
            // Re-verify every signature in order so key lifecycle events take effect.
            let report = store.walk(1, to, true).await?;
            if let Some(first) = report.breaks.first() {
                return Err(LedgerError::BrokenChain {
                    sequence: first.sequence,
                    reason: first.reason.clone(),
                });
            }
        }
        if let Some(last) = last {
            *store.head.lock().await = last.as_head();
        }

        info!(head = %store.head.lock().await, "Ledger opened");
        Ok(store)
    }

    pub fn with_anomaly_tracker(mut self, tracker: Arc<AnomalyTracker>) -> Self {
        self.anomalies = Some(tracker);
        self
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Append a pre-signed draft.
    ///
    /// Rejects with `ChainConflict` if the draft does not extend the current
    /// head. Either the event is durably stored and visible, or nothing is.
    #[instrument(skip(self, draft), fields(sequence = draft.sequence, event_type = %draft.event_type))]
    pub async fn append(&self, draft: EventDraft) -> Result<Event, LedgerError> {
        let source = SourceId::new(draft.signing_key_id.0.clone());
        let result = self.append_inner(draft).await;

        if let Err(e) = &result {
            if e.is_submitter_fault() {
                if let Some(tracker) = &self.anomalies {
                    tracker.record(&source, e.reason_code()).await;
                }
            }
        }
        result
    }

    async fn append_inner(&self, draft: EventDraft) -> Result<Event, LedgerError> {
        if draft.signature.is_empty() {
            return Err(LedgerError::MissingField("signature"));
        }
        if draft.signing_key_id.0.is_empty() {
            return Err(LedgerError::MissingField("signing_key_id"));
        }
        self.schemas.validate(&draft)?;

        let mut head = self.head.lock().await;
        if draft.sequence != head.next_sequence() || draft.previous_hash != head.hash {
            debug!(head = %*head, "Draft does not extend head");
            return Err(LedgerError::ChainConflict {
                head_sequence: head.sequence,
                head_hash: head.hash,
                draft_sequence: draft.sequence,
                draft_previous: draft.previous_hash,
            });
        }

        let content_hash = draft.content_hash()?;
        let event = Event::from_draft(draft, content_hash);

        self.verifier
            .verify_event(&event)
            .map_err(|e| LedgerError::InvalidSignature {
                sequence: event.sequence,
                reason: e.to_string(),
            })?;
        self.verifier
            .verify_witnesses(&event)
            .map_err(|e| LedgerError::InvalidSignature {
                sequence: event.sequence,
                reason: format!("witness: {e}"),
            })?;
        self.verifier
            .check_committable(&event)
            .map_err(|e| LedgerError::KeyLifecycle {
                sequence: event.sequence,
                reason: e.to_string(),
            })?;

        self.storage.insert(&event).await?;
        *head = event.as_head();

        // Checked above under the same head lock.
        if let Err(e) = self.verifier.on_committed(&event) {
            error!(sequence = event.sequence, error = %e, "Committed key lifecycle event diverged from registry");
        }
        let _ = self.committed.send(event.clone());

        debug!(head = %*head, "Event appended");
        Ok(event)
    }

    pub async fn head(&self) -> LedgerHead {
        *self.head.lock().await
    }

    /// Events with `from <= sequence <= to`. `to` beyond the head is clamped.
    pub async fn read(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        let head = self.head().await;
        if from == 0 || from > to {
            return Err(LedgerError::InvalidRange {
                from,
                to,
                head: head.sequence,
            });
        }
        self.storage.range(from, to.min(head.sequence)).await
    }

    pub async fn get(&self, sequence: u64) -> Result<Option<Event>, LedgerError> {
        self.storage.get(sequence).await
    }

    /// `true` iff every event in range has a valid hash, link and signature.
    pub async fn verify_chain(&self, from: u64, to: u64) -> Result<bool, LedgerError> {
        Ok(self.integrity_report(from, to).await?.is_intact())
    }

    /// Re-walk a range and report every break found.
    pub async fn integrity_report(&self, from: u64, to: u64) -> Result<ChainReport, LedgerError> {
        let head = self.head().await;
        if from == 0 || from > to || to > head.sequence {
            return Err(LedgerError::InvalidRange {
                from,
                to,
                head: head.sequence,
            });
        }
        let mut report = self.walk(from, to, false).await?;
        report.wal = self.storage.wal_report().await?;
        Ok(report)
    }

    /// Hand every event from `from` to the head to `handler`, in order.
    pub async fn replay<F>(&self, from: u64, mut handler: F) -> Result<u64, LedgerError>
    where
        F: FnMut(&Event) -> Result<(), LedgerError>,
    {
        let head = self.head().await;
        if head.sequence == 0 || from > head.sequence {
            return Ok(0);
        }
        let events = self.storage.range(from.max(1), head.sequence).await?;
        let mut count = 0u64;
        for event in &events {
            handler(event)?;
            count += 1;
        }
        info!(replayed = count, from, "Ledger replay complete");
        Ok(count)
    }

    /// Subscribe to committed events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.committed.subscribe()
    }

    async fn walk(&self, from: u64, to: u64, apply: bool) -> Result<ChainReport, LedgerError> {
        let mut report = ChainReport {
            from,
            to,
            ..ChainReport::default()
        };
        let mut previous = if from == 1 {
            Some(ContentHash::zero())
        } else {
            self.storage.get(from - 1).await?.map(|e| e.content_hash)
        };

        for event in self.storage.range(from, to).await? {
            report.checked += 1;
            let mut fail = |reason: String| {
                report.breaks.push(ChainBreak {
                    sequence: event.sequence,
                    reason,
                })
            };
            if !event.verify_content_hash() {
                fail("content hash mismatch".into());
            }
            if previous != Some(event.previous_hash) {
                fail("previous hash does not link".into());
            }
            if let Err(e) = self.verifier.verify_event(&event) {
                fail(format!("signature: {e}"));
            }
            if let Err(e) = self.verifier.verify_witnesses(&event) {
                fail(format!("witness: {e}"));
            }
            if apply {
                if let Err(e) = self.verifier.on_committed(&event) {
                    fail(format!("key lifecycle: {e}"));
                }
            }
            previous = Some(event.content_hash);
            report.tip = Some(event.content_hash);
        }

        if report.checked != to - from + 1 {
            report.breaks.push(ChainBreak {
                sequence: from + report.checked,
                reason: "gap in sequence".into(),
            });
        }
        Ok(report)
    }
}

#[async_trait]
impl LedgerSource for LedgerStore {
    async fn head(&self) -> Result<LedgerHead, LedgerError> {
        Ok(LedgerStore::head(self).await)
    }

    async fn read(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        LedgerStore::read(self, from, to).await
    }
}
