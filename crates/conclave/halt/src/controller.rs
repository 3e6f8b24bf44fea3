//! Halt controller.
//!
//! Trigger is fail-closed: both channels are set before the ledger record
//! is attempted, and a ledger failure never un-halts. Clearing is sticky: it
//! needs a `HaltClear` ceremony for the current halt that the ledger shows
//! reached `EXECUTING`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conclave_ledger::{AnomalyTracker, EventAuthor, FaultReport, FaultSink};
use conclave_types::{
    CeremonyState, CeremonySubject, CeremonyType, EventPayload, HaltId, SharedClock, SourceId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::channel::{DurableFlag, FastChannel};
use crate::error::HaltError;
use crate::limiter::{Admission, LimiterConfig, TriggerLimiter};
use crate::state::{CeremonyRef, HaltEvent, HaltRecord, HaltState, HaltTransition};

const LEDGER_SCAN_BATCH: u64 = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HaltConfig {
    /// Durable flag poll interval while the fast channel is healthy.
    pub poll_interval_ms: u64,
    /// Shortened poll interval while the fast channel is unreachable.
    pub degraded_poll_interval_ms: u64,
    pub rate_window_secs: i64,
    pub per_source_limit: u32,
    pub aggregate_limit: u32,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            degraded_poll_interval_ms: 100,
            rate_window_secs: 60,
            per_source_limit: 3,
            aggregate_limit: 10,
        }
    }
}

impl HaltConfig {
    fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            window: Duration::seconds(self.rate_window_secs),
            per_source: self.per_source_limit,
            aggregate: self.aggregate_limit,
        }
    }
}

struct FlagCache {
    state: HaltState,
    loaded_at: DateTime<Utc>,
}

pub struct HaltController {
    config: HaltConfig,
    fast: Arc<dyn FastChannel>,
    durable: Arc<dyn DurableFlag>,
    cache: RwLock<FlagCache>,
    author: EventAuthor,
    limiter: TriggerLimiter,
    anomalies: Option<Arc<AnomalyTracker>>,
    transitions: broadcast::Sender<HaltTransition>,
    degraded: AtomicBool,
    clock: SharedClock,
    transition_lock: Mutex<()>,
}

impl HaltController {
    /// Load the durable flag and re-publish any halt it holds.
    #[instrument(skip_all)]
    pub async fn open(
        config: HaltConfig,
        fast: Arc<dyn FastChannel>,
        durable: Arc<dyn DurableFlag>,
        author: EventAuthor,
    ) -> Result<Self, HaltError> {
        let state = durable.load().await?;
        if let HaltState::Halted(record) = &state {
            warn!(halt_id = %record.halt_id, reason = %record.reason, "Halt still in force from durable flag");
            fast.publish(state.clone())?;
        }
        let clock = author.clock().clone();
        let (transitions, _) = broadcast::channel(64);
        Ok(Self {
            limiter: TriggerLimiter::new(config.limiter()),
            config,
            fast,
            durable,
            cache: RwLock::new(FlagCache {
                state,
                loaded_at: clock.now(),
            }),
            author,
            anomalies: None,
            transitions,
            degraded: AtomicBool::new(false),
            clock,
            transition_lock: Mutex::new(()),
        })
    }

    /// Rate-limited triggers are counted against the source here.
    pub fn with_anomaly_tracker(mut self, tracker: Arc<AnomalyTracker>) -> Self {
        self.anomalies = Some(tracker);
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// `Ok` only if neither channel reports a halt.
    pub async fn check(&self) -> Result<(), HaltError> {
        match self.state().await? {
            HaltState::Running => Ok(()),
            HaltState::Halted(record) => Err(HaltError::Halted {
                halt_id: record.halt_id,
                reason: record.reason,
            }),
        }
    }

    /// Combined view of both channels.
    pub async fn state(&self) -> Result<HaltState, HaltError> {
        let fast = match self.fast.current() {
            Ok(state) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!("Fast halt channel restored");
                }
                Some(state)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(error = %e, "Fast halt channel unreachable, polling durable flag");
                }
                None
            }
        };

        let durable = if fast.is_none() {
            self.fresh_flag().await?
        } else {
            self.cache.read().await.state.clone()
        };

        Ok(match (fast, durable) {
            (Some(HaltState::Halted(record)), _) | (_, HaltState::Halted(record)) => {
                HaltState::Halted(record)
            }
            _ => HaltState::Running,
        })
    }

    /// The flag as of at most one degraded poll interval ago.
    async fn fresh_flag(&self) -> Result<HaltState, HaltError> {
        let max_age = Duration::milliseconds(self.config.degraded_poll_interval_ms as i64);
        {
            let cache = self.cache.read().await;
            if self.clock.now() - cache.loaded_at <= max_age {
                return Ok(cache.state.clone());
            }
        }
        self.refresh_flag()
            .await
            .map_err(|e| HaltError::Unverifiable(format!("fast channel down and durable flag unreadable: {e}")))
    }

    /// Reload the durable flag into the cache. A halt this process already
    /// latched is kept and written back if the flag lost it.
    async fn refresh_flag(&self) -> Result<HaltState, HaltError> {
        let loaded = self.durable.load().await?;
        let mut cache = self.cache.write().await;
        let state = match (&cache.state, loaded) {
            (HaltState::Halted(latched), HaltState::Running) => {
                warn!(halt_id = %latched.halt_id, "Durable flag lost an active halt, rewriting");
                let latched = HaltState::Halted(latched.clone());
                if let Err(e) = self.durable.store(&latched).await {
                    error!(error = %e, "Could not rewrite durable halt flag");
                }
                latched
            }
            (_, loaded) => loaded,
        };
        cache.state = state.clone();
        cache.loaded_at = self.clock.now();
        Ok(state)
    }

    pub async fn current_halt(&self) -> Option<HaltRecord> {
        match self.state().await {
            Ok(HaltState::Halted(record)) => Some(record),
            Ok(HaltState::Running) => None,
            Err(_) => self.cache.read().await.state.record().cloned(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HaltTransition> {
        self.transitions.subscribe()
    }

    /// Halt the system.
    ///
    /// If a halt is already in force the trigger joins it and no new record
    /// is written. Returns `SourceRateLimited` when `source` exceeds its
    /// per-window allowance.
    #[instrument(skip(self, reason, source), fields(source = %source))]
    pub async fn trigger(
        &self,
        reason: impl Into<String>,
        source: SourceId,
    ) -> Result<HaltEvent, HaltError> {
        let reason = reason.into();
        let now = self.clock.now();

        let admission = self.limiter.admit(&source, now);
        if admission == Admission::SourceLimited {
            warn!(%reason, "Halt trigger suppressed by per-source limit");
            if let Some(tracker) = &self.anomalies {
                tracker.record(&source, "HALT_SOURCE_RATE_LIMITED").await;
            }
            return Err(HaltError::SourceRateLimited { origin: source });
        }

        let _serial = self.transition_lock.lock().await;

        let (mut record, already_halted) = match self.current_halt().await {
            Some(existing) => {
                info!(halt_id = %existing.halt_id, %reason, "Trigger joined active halt");
                (existing, true)
            }
            None => {
                let record = HaltRecord {
                    halt_id: HaltId::new(),
                    reason: reason.clone(),
                    source: source.clone(),
                    triggered_at: now,
                    escalated: false,
                };
                self.latch(&HaltState::Halted(record.clone())).await;
                error!(halt_id = %record.halt_id, %reason, "SYSTEM HALTED");
                let _ = self.transitions.send(HaltTransition::Triggered(record.clone()));
                (record, false)
            }
        };

        let mut event = HaltEvent {
            record: record.clone(),
            already_halted,
            ledger_sequence: None,
            ledger_error: None,
        };

        if !already_halted {
            let payload = EventPayload::HaltTriggered {
                halt_id: record.halt_id,
                reason: record.reason.clone(),
                source: record.source.clone(),
                escalated: false,
            };
            match self.author.append(payload).await {
                Ok(committed) => event.ledger_sequence = Some(committed.sequence),
                Err(e) => {
                    error!(halt_id = %record.halt_id, error = %e, "Halt is in force but its ledger record failed");
                    event.ledger_error = Some(e.to_string());
                }
            }
        }

        if let Admission::Escalate {
            window_triggers,
            sources,
        } = admission
        {
            record.escalated = true;
            self.escalate(&record, window_triggers, sources).await;
            event.record = record;
        }

        Ok(event)
    }

    /// Publish on both channels. Failures are logged; the cache latches the
    /// halt so `check` reports it even if neither channel took the write.
    async fn latch(&self, state: &HaltState) {
        {
            let mut cache = self.cache.write().await;
            cache.state = state.clone();
            cache.loaded_at = self.clock.now();
        }
        if let Err(e) = self.fast.publish(state.clone()) {
            error!(error = %e, "Fast halt channel publish failed");
        }
        if let Err(e) = self.durable.store(state).await {
            error!(error = %e, "Durable halt flag write failed");
        }
    }

    async fn escalate(&self, record: &HaltRecord, window_triggers: u32, sources: Vec<SourceId>) {
        warn!(halt_id = %record.halt_id, window_triggers, "Aggregate halt rate exceeded, escalating for review");
        self.latch(&HaltState::Halted(record.clone())).await;
        if let Err(e) = self
            .author
            .append(EventPayload::HaltEscalated {
                window_triggers,
                sources,
            })
            .await
        {
            error!(error = %e, "Halt escalation record failed");
        }
        let _ = self.transitions.send(HaltTransition::Escalated {
            halt_id: record.halt_id,
            window_triggers,
        });
    }

    /// Clear the current halt on the authority of a `HaltClear` ceremony.
    #[instrument(skip(self), fields(ceremony_id = %ceremony.ceremony_id, halt_id = %ceremony.halt_id))]
    pub async fn clear(&self, ceremony: &CeremonyRef) -> Result<(), HaltError> {
        let _serial = self.transition_lock.lock().await;

        let current = self.current_halt().await.ok_or(HaltError::NotHalted)?;
        if current.halt_id != ceremony.halt_id {
            return Err(HaltError::HaltMismatch {
                current: current.halt_id,
                requested: ceremony.halt_id,
            });
        }
        self.verify_clear_ceremony(ceremony).await?;

        self.author
            .append(EventPayload::HaltCleared {
                halt_id: current.halt_id,
                ceremony_id: ceremony.ceremony_id,
            })
            .await?;

        // Durable first: if it fails the system stays halted.
        self.durable.store(&HaltState::Running).await?;
        {
            let mut cache = self.cache.write().await;
            cache.state = HaltState::Running;
            cache.loaded_at = self.clock.now();
        }
        self.fast.publish(HaltState::Running)?;
        self.limiter.reset();

        info!("Halt cleared by ceremony");
        let _ = self.transitions.send(HaltTransition::Cleared {
            halt_id: current.halt_id,
            ceremony_id: ceremony.ceremony_id,
            cleared_at: self.clock.now(),
        });
        Ok(())
    }

    /// Find the ceremony's `EXECUTING` transition in the ledger, newest first.
    async fn verify_clear_ceremony(&self, ceremony: &CeremonyRef) -> Result<(), HaltError> {
        let unauthorized = |reason: &str| HaltError::ClearNotAuthorized {
            ceremony_id: ceremony.ceremony_id,
            reason: reason.to_string(),
        };

        let store = self.author.store();
        let mut to = store.head().await.sequence;
        while to > 0 {
            let from = to.saturating_sub(LEDGER_SCAN_BATCH - 1).max(1);
            for event in store.read(from, to).await?.iter().rev() {
                let EventPayload::CeremonyTransitioned {
                    ceremony_id,
                    ceremony_type,
                    subject,
                    to: state,
                    ..
                } = &event.payload
                else {
                    continue;
                };
                if *ceremony_id != ceremony.ceremony_id || *state != CeremonyState::Executing {
                    continue;
                }
                if *ceremony_type != CeremonyType::HaltClear {
                    return Err(unauthorized("ceremony is not a halt clear"));
                }
                return match subject {
                    CeremonySubject::Halt { halt_id } if *halt_id == ceremony.halt_id => Ok(()),
                    _ => Err(unauthorized("ceremony was raised for a different halt")),
                };
            }
            to = from - 1;
        }
        Err(unauthorized("no EXECUTING record in the ledger"))
    }

    /// Poll the durable flag, propagating halts raised elsewhere to the fast
    /// channel. Never clears.
    pub async fn run_flag_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Durable halt flag poller started");
        loop {
            let interval = if self.is_degraded() {
                self.config.degraded_poll_interval_ms
            } else {
                self.config.poll_interval_ms
            };
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_millis(interval)) => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Durable halt flag poller stopped");
    }

    pub async fn poll_once(&self) {
        let flag = match self.refresh_flag().await {
            Ok(flag) => flag,
            Err(e) => {
                error!(error = %e, "Durable halt flag unreadable");
                return;
            }
        };
        let HaltState::Halted(record) = flag else {
            return;
        };
        match self.fast.current() {
            Ok(HaltState::Running) => {
                warn!(halt_id = %record.halt_id, "Halt found on durable flag, publishing");
                if let Err(e) = self.fast.publish(HaltState::Halted(record.clone())) {
                    error!(error = %e, "Fast halt channel publish failed");
                }
                let _ = self.transitions.send(HaltTransition::Triggered(record));
            }
            Ok(HaltState::Halted(_)) => {}
            Err(_) => {
                self.degraded.store(true, Ordering::Release);
            }
        }
    }

    /// Consume faults from a [`conclave_ledger::fault_channel`] until it closes.
    pub fn spawn_fault_listener(self: &Arc<Self>, mut faults: mpsc::Receiver<FaultReport>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(fault) = faults.recv().await {
                controller.report(fault).await;
            }
        })
    }
}

#[async_trait]
impl FaultSink for HaltController {
    async fn report(&self, fault: FaultReport) {
        let payload = EventPayload::IntegrityFault {
            fault_kind: fault.kind.as_str().to_string(),
            detail: fault.detail.clone(),
        };
        if let Err(e) = self.author.append(payload).await {
            warn!(error = %e, "Integrity fault could not be recorded");
        }
        match self
            .trigger(format!("{}: {}", fault.kind, fault.detail), fault.source.clone())
            .await
        {
            Ok(event) => info!(halt_id = %event.record.halt_id, kind = %fault.kind, "Halted on integrity fault"),
            Err(e) => error!(error = %e, kind = %fault.kind, "Integrity fault did not raise a halt"),
        }
    }
}
