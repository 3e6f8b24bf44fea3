//! Independent observation paths to the canonical writer.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conclave_ledger::{LedgerReplica, LedgerSource};
use conclave_types::SharedClock;
use serde::{Deserialize, Serialize};

/// One way of telling whether the writer is alive.
///
/// Paths must be independent: a single network fault should not take out
/// more than one of them.
#[async_trait]
pub trait LivenessPath: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok` if the writer looks alive from this path.
    async fn probe(&self) -> Result<(), String>;
}

/// Result of probing one path in one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathObservation {
    pub path: String,
    pub alive: bool,
    pub detail: Option<String>,
    pub latency_ms: u64,
    pub observed_at: DateTime<Utc>,
}

// ── Head probe ──────────────────────────────────────────────────────────

/// Asks the writer for its head directly.
pub struct HeadProbe {
    name: String,
    writer: Arc<dyn LedgerSource>,
}

impl HeadProbe {
    pub fn new(name: impl Into<String>, writer: Arc<dyn LedgerSource>) -> Self {
        Self {
            name: name.into(),
            writer,
        }
    }
}

#[async_trait]
impl LivenessPath for HeadProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        self.writer.head().await.map(|_| ()).map_err(|e| e.to_string())
    }
}

// ── Heartbeat board ─────────────────────────────────────────────────────

/// Where the writer posts heartbeats, read out of band from the ledger.
#[derive(Default)]
pub struct HeartbeatBoard {
    last: RwLock<Option<DateTime<Utc>>>,
}

impl HeartbeatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, at: DateTime<Utc>) {
        let mut last = self.last.write().unwrap_or_else(|e| e.into_inner());
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        *self.last.read().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct HeartbeatPath {
    name: String,
    board: Arc<HeartbeatBoard>,
    max_age: Duration,
    clock: SharedClock,
}

impl HeartbeatPath {
    pub fn new(name: impl Into<String>, board: Arc<HeartbeatBoard>, max_age: Duration, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            board,
            max_age,
            clock,
        }
    }
}

#[async_trait]
impl LivenessPath for HeartbeatPath {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        let Some(last) = self.board.last_beat() else {
            return Err("no heartbeat posted".into());
        };
        let age = self.clock.now() - last;
        if age > self.max_age {
            Err(format!("last heartbeat {}ms ago", age.num_milliseconds()))
        } else {
            Ok(())
        }
    }
}

// ── Replica follow ──────────────────────────────────────────────────────

/// Alive while a replica keeps syncing from the writer.
pub struct ReplicaFollowPath {
    name: String,
    replica: Arc<LedgerReplica>,
    max_silence: Duration,
    clock: SharedClock,
}

impl ReplicaFollowPath {
    pub fn new(name: impl Into<String>, replica: Arc<LedgerReplica>, max_silence: Duration, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            replica,
            max_silence,
            clock,
        }
    }
}

#[async_trait]
impl LivenessPath for ReplicaFollowPath {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        let status = self.replica.status().await;
        if let Some(reason) = status.faulted {
            return Err(format!("replica faulted: {reason}"));
        }
        match status.last_sync_at {
            None => Err("replica has never synced".into()),
            Some(at) if self.clock.now() - at > self.max_silence => {
                Err(format!("replica last synced at {at}"))
            }
            Some(_) => Ok(()),
        }
    }
}
