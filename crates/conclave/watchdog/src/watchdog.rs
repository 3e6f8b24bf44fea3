//! Writer liveness watchdog.
//!
//! Each round probes every path. All paths failing for `dead_after_rounds`
//! consecutive rounds means the writer is dead: the system halts and a
//! failover ceremony is requested. Paths that disagree mean a partition: the
//! system halts and no failover is attempted.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use conclave_ceremony::CeremonyEngine;
use conclave_halt::HaltController;
use conclave_types::{ApproverId, CeremonyId, CeremonySubject, CeremonyType, HaltId, SharedClock, SourceId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{WatchdogError, WatchdogResult};
use crate::path::{LivenessPath, PathObservation};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Name of the writer being watched.
    pub writer_id: String,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive all-fail rounds before the writer is declared dead.
    pub dead_after_rounds: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            writer_id: "writer-primary".into(),
            interval_ms: 1_000,
            probe_timeout_ms: 500,
            dead_after_rounds: 3,
        }
    }
}

/// What one round concluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    /// Every path failed, `rounds` times in a row so far.
    Unreachable { rounds: u32 },
    Partition { alive: Vec<String>, failing: Vec<String> },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchdogEvent {
    RoundCompleted {
        round: u64,
        verdict: Verdict,
        observations: Vec<PathObservation>,
    },
    WriterDeclaredDead { writer_id: String, rounds: u32 },
    DeathHalt { halt_id: HaltId },
    FailoverRequested { writer_id: String, ceremony_id: CeremonyId },
    FailoverRequestFailed { writer_id: String, reason: String },
    PartitionHalt { halt_id: HaltId },
    Recovered { writer_id: String },
}

/// Opens the witnessed failover ceremony once the writer is declared dead.
#[async_trait]
pub trait FailoverInitiator: Send + Sync {
    async fn initiate(&self, dead_writer: &str) -> WatchdogResult<CeremonyId>;
}

/// Requests a `WriterFailover` ceremony promoting a fixed standby.
pub struct CeremonyFailoverInitiator {
    engine: Arc<CeremonyEngine>,
    standby: String,
    requested_by: ApproverId,
}

impl CeremonyFailoverInitiator {
    pub fn new(engine: Arc<CeremonyEngine>, standby: impl Into<String>, requested_by: ApproverId) -> Self {
        Self {
            engine,
            standby: standby.into(),
            requested_by,
        }
    }
}

#[async_trait]
impl FailoverInitiator for CeremonyFailoverInitiator {
    async fn initiate(&self, dead_writer: &str) -> WatchdogResult<CeremonyId> {
        let ceremony = self
            .engine
            .request(
                CeremonyType::WriterFailover,
                CeremonySubject::WriterFailover {
                    previous_writer: dead_writer.to_string(),
                    new_writer: self.standby.clone(),
                },
                self.requested_by.clone(),
            )
            .await?;
        Ok(ceremony.id)
    }
}

#[derive(Default)]
struct RoundState {
    round: u64,
    consecutive_dead: u32,
    failover_requested: bool,
    partition_halted: bool,
}

pub struct Watchdog {
    config: WatchdogConfig,
    paths: Vec<Arc<dyn LivenessPath>>,
    halt: Arc<HaltController>,
    initiator: Arc<dyn FailoverInitiator>,
    clock: SharedClock,
    state: Mutex<RoundState>,
    events: broadcast::Sender<WatchdogEvent>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        paths: Vec<Arc<dyn LivenessPath>>,
        halt: Arc<HaltController>,
        initiator: Arc<dyn FailoverInitiator>,
    ) -> WatchdogResult<Self> {
        if paths.len() < 2 {
            return Err(WatchdogError::InsufficientPaths(paths.len()));
        }
        let clock = halt.clock().clone();
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            config,
            paths,
            halt,
            initiator,
            clock,
            state: Mutex::new(RoundState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    /// Probe every path once and act on the verdict.
    pub async fn observe_round(&self) -> WatchdogResult<Verdict> {
        let observations = self.probe_all().await;
        let (alive, failing): (Vec<_>, Vec<_>) = observations.iter().partition(|o| o.alive);
        let alive: Vec<String> = alive.into_iter().map(|o| o.path.clone()).collect();
        let failing: Vec<String> = failing.into_iter().map(|o| o.path.clone()).collect();

        let mut state = self.state.lock().await;
        state.round += 1;
        let verdict = if failing.is_empty() {
            if state.consecutive_dead > 0 || state.failover_requested || state.partition_halted {
                info!(writer = %self.config.writer_id, "Writer reachable on every path again");
                self.emit(WatchdogEvent::Recovered {
                    writer_id: self.config.writer_id.clone(),
                });
            }
            *state = RoundState {
                round: state.round,
                ..RoundState::default()
            };
            Verdict::Healthy
        } else if alive.is_empty() {
            state.consecutive_dead += 1;
            Verdict::Unreachable {
                rounds: state.consecutive_dead,
            }
        } else {
            state.consecutive_dead = 0;
            Verdict::Partition { alive, failing }
        };
        debug!(round = state.round, ?verdict, "Watchdog round");
        self.emit(WatchdogEvent::RoundCompleted {
            round: state.round,
            verdict: verdict.clone(),
            observations,
        });

        match &verdict {
            Verdict::Healthy => {}
            Verdict::Unreachable { rounds } => {
                if *rounds >= self.config.dead_after_rounds && !state.failover_requested {
                    state.failover_requested = true;
                    drop(state);
                    self.declare_dead(*rounds).await;
                }
            }
            Verdict::Partition { alive, failing } => {
                if !state.partition_halted {
                    state.partition_halted = true;
                    drop(state);
                    self.halt_for_partition(alive, failing).await?;
                }
            }
        }
        Ok(verdict)
    }

    /// Rounds until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.interval_ms.max(1)));
        info!(writer = %self.config.writer_id, paths = self.paths.len(), "Watchdog started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.observe_round().await {
                        error!(error = %e, "Watchdog round failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Watchdog stopped");
    }

    async fn probe_all(&self) -> Vec<PathObservation> {
        let timeout = StdDuration::from_millis(self.config.probe_timeout_ms);
        join_all(self.paths.iter().map(|path| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, path.probe()).await {
                Ok(result) => result,
                Err(_) => Err(format!("no answer within {}ms", timeout.as_millis())),
            };
            PathObservation {
                path: path.name().to_string(),
                alive: outcome.is_ok(),
                detail: outcome.err(),
                latency_ms: started.elapsed().as_millis() as u64,
                observed_at: self.clock.now(),
            }
        }))
        .await
    }

    async fn declare_dead(&self, rounds: u32) {
        let writer_id = self.config.writer_id.clone();
        error!(writer = %writer_id, rounds, "Writer declared dead, halting and requesting failover ceremony");
        self.emit(WatchdogEvent::WriterDeclaredDead {
            writer_id: writer_id.clone(),
            rounds,
        });

        // Failover ceremonies proceed while halted.
        let reason = WatchdogError::WriterUnreachable { rounds };
        match self.halt.trigger(reason.to_string(), SourceId::new("watchdog")).await {
            Ok(event) => self.emit(WatchdogEvent::DeathHalt {
                halt_id: event.record.halt_id,
            }),
            Err(e) => error!(error = %e, "Halt for dead writer failed"),
        }

        match self.initiator.initiate(&writer_id).await {
            Ok(ceremony_id) => {
                info!(ceremony_id = %ceremony_id, "Writer failover ceremony requested");
                self.emit(WatchdogEvent::FailoverRequested { writer_id, ceremony_id });
            }
            Err(e) => {
                error!(error = %e, "Writer failover request failed");
                self.state.lock().await.failover_requested = false;
                self.emit(WatchdogEvent::FailoverRequestFailed {
                    writer_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn halt_for_partition(&self, alive: &[String], failing: &[String]) -> WatchdogResult<()> {
        warn!(?alive, ?failing, "Liveness paths disagree, halting for partition");
        let reason = WatchdogError::PartitionDetected {
            alive: alive.to_vec(),
            failing: failing.to_vec(),
        };
        match self.halt.trigger(reason.to_string(), SourceId::new("watchdog")).await {
            Ok(event) => {
                self.emit(WatchdogEvent::PartitionHalt {
                    halt_id: event.record.halt_id,
                });
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.partition_halted = false;
                Err(e.into())
            }
        }
    }

    fn emit(&self, event: WatchdogEvent) {
        let _ = self.events.send(event);
    }
}
