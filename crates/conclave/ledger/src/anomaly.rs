//! Integrity fault reporting and anomaly tracking.
//!
//! Replicas and the anomaly tracker never reconcile on their own: they hand
//! a [`FaultReport`] to a [`FaultSink`], which the kernel wires to the halt
//! controller.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conclave_types::{SharedClock, SourceId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// One source kept submitting drafts that failed integrity checks.
    RepeatedRejections,
    /// A replica saw a different hash at a shared sequence.
    ReplicaDivergence,
    /// A replica saw a bad signature or broken link from the writer.
    ReplicaVerificationFailed,
    /// A replica fell further behind than allowed.
    ReplicaLag,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::RepeatedRejections => "repeated_rejections",
            FaultKind::ReplicaDivergence => "replica_divergence",
            FaultKind::ReplicaVerificationFailed => "replica_verification_failed",
            FaultKind::ReplicaLag => "replica_lag",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A critical integrity fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub source: SourceId,
    pub sequence: Option<u64>,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

/// Receives critical integrity faults.
#[async_trait]
pub trait FaultSink: Send + Sync {
    async fn report(&self, fault: FaultReport);
}

/// Forwards faults over an mpsc channel to a listener task.
#[derive(Clone)]
pub struct ChannelFaultSink {
    tx: mpsc::Sender<FaultReport>,
}

pub fn fault_channel(capacity: usize) -> (ChannelFaultSink, mpsc::Receiver<FaultReport>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelFaultSink { tx }, rx)
}

#[async_trait]
impl FaultSink for ChannelFaultSink {
    async fn report(&self, fault: FaultReport) {
        if let Err(e) = self.tx.send(fault).await {
            // Listener gone: nobody can halt on this fault any more.
            error!(fault = ?e.0, "Fault listener closed, fault dropped");
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnomalyConfig {
    pub window: Duration,
    /// Rejections within `window` that raise a fault.
    pub threshold: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(5),
            threshold: 5,
        }
    }
}

/// Counts integrity rejections per source inside a sliding window.
pub struct AnomalyTracker {
    config: AnomalyConfig,
    clock: SharedClock,
    rejections: DashMap<SourceId, VecDeque<DateTime<Utc>>>,
    sink: Arc<dyn FaultSink>,
}

impl AnomalyTracker {
    pub fn new(config: AnomalyConfig, clock: SharedClock, sink: Arc<dyn FaultSink>) -> Self {
        Self {
            config,
            clock,
            rejections: DashMap::new(),
            sink,
        }
    }

    /// Record one rejection. Returns `true` if it raised a fault.
    pub async fn record(&self, source: &SourceId, reason_code: &'static str) -> bool {
        let now = self.clock.now();
        let count = {
            let mut entry = self.rejections.entry(source.clone()).or_default();
            let cutoff = now - self.config.window;
            while entry.front().is_some_and(|t| *t < cutoff) {
                entry.pop_front();
            }
            entry.push_back(now);
            let count = entry.len();
            if count >= self.config.threshold {
                entry.clear();
            }
            count
        };

        warn!(source = %source, reason = reason_code, count, "Integrity rejection recorded");
        if count < self.config.threshold {
            return false;
        }

        self.sink
            .report(FaultReport {
                kind: FaultKind::RepeatedRejections,
                source: source.clone(),
                sequence: None,
                detail: format!("{count} integrity rejections ({reason_code}) within {}s", self.config.window.num_seconds()),
                detected_at: now,
            })
            .await;
        true
    }

    /// Rejections from `source` still inside the window.
    pub fn recent(&self, source: &SourceId) -> usize {
        let cutoff = self.clock.now() - self.config.window;
        self.rejections
            .get(source)
            .map(|q| q.iter().filter(|t| **t >= cutoff).count())
            .unwrap_or(0)
    }
}
