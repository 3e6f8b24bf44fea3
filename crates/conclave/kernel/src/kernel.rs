//! The constitutional kernel: every component wired over one ledger.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use conclave_ceremony::{
    AmendmentEffect, ApproverRegistry, AuditLog, AuditStore, CeremonyEffect, CeremonyEngine, EffectRegistry,
    FailoverEffect, FailoverHandler, FileAuditStore, HaltClearEffect, KeyRotationEffect, MemoryAuditStore,
    ParameterEffect, ParameterTable, RecoveryReport, WitnessDiversity,
};
use conclave_context::{BundleStore, BundleVerifier, ContextBuilder, FileBundleStore, MemoryBundleStore};
use conclave_halt::{DurableFlag, FileFlag, HaltController, HaltState, MemoryFlag, WatchChannel};
use conclave_ledger::{
    fault_channel, AnomalyTracker, ChannelFaultSink, EventAuthor, EventStorage, LedgerError, LedgerReplica,
    LedgerSource, LedgerStore, MemoryEventStorage, SchemaRegistry, WalEventStorage,
};
use conclave_signing::{KeyRegistry, SigningService, SoftwareKeyCustody};
use conclave_types::{
    ApproverId, CeremonyId, CeremonyState, CeremonyType, Classified, Event, EventDraft, EventPayload, KeyId,
    KeyRecord, KeyStatus, LedgerHead, SharedClock, SourceId, SystemClock, Tier,
};
use conclave_watchdog::{CeremonyFailoverInitiator, HeartbeatBoard, LivenessPath, Watchdog};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::boundary::{BoundaryHandler, OperatorNotice};
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::keys::KeyDirectory;

const FAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
pub struct CeremonySummary {
    pub id: CeremonyId,
    pub ceremony_type: CeremonyType,
    pub tier: Tier,
    pub state: CeremonyState,
    pub requested_at: DateTime<Utc>,
    pub approvals: usize,
    pub required_approvals: usize,
    pub witnesses: usize,
    pub required_witnesses: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct KernelStatus {
    pub head: LedgerHead,
    pub halt: HaltState,
    pub halt_degraded: bool,
    pub writer_key: KeyId,
    pub keys: Vec<KeyRecord>,
    pub active_ceremonies: Vec<CeremonySummary>,
    pub parameters: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired: Vec<CeremonyId>,
    pub revoked: Vec<KeyId>,
    /// Rotation finalization waits while the system is halted.
    pub rotations_deferred: bool,
}

pub struct ConstitutionalKernel {
    config: KernelConfig,
    clock: SharedClock,
    keys: KeyDirectory,
    custody: Arc<SoftwareKeyCustody>,
    registry: Arc<KeyRegistry>,
    store: Arc<LedgerStore>,
    author: EventAuthor,
    anomalies: Arc<AnomalyTracker>,
    faults: ChannelFaultSink,
    halt: Arc<HaltController>,
    ceremonies: Arc<CeremonyEngine>,
    parameters: Arc<ParameterTable>,
    context: ContextBuilder,
    bundles: BundleVerifier,
    heartbeat: Arc<HeartbeatBoard>,
    boundary: BoundaryHandler,
    recovery: RecoveryReport,
    fault_listener: JoinHandle<()>,
}

impl ConstitutionalKernel {
    /// Open with the system clock and the writer key from `config.key_dir()`.
    pub async fn from_config(config: KernelConfig, failover: Arc<dyn FailoverHandler>) -> KernelResult<Self> {
        let keys = KeyDirectory::new(config.key_dir());
        let custody = keys.load_custody(&KeyId::new(&config.signing.key_id)).await?;
        Self::open(config, Arc::new(custody), failover, Arc::new(SystemClock)).await
    }

    /// Open storage, rebuild every component from it and recover in-flight
    /// ceremonies.
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
    pub async fn open(
        config: KernelConfig,
        custody: Arc<SoftwareKeyCustody>,
        failover: Arc<dyn FailoverHandler>,
        clock: SharedClock,
    ) -> KernelResult<Self> {
        config.validate()?;
        let durable = config.storage.is_durable();

        // ── Ledger ──────────────────────────────────────────────────────
        let (store, registry) = open_ledger(&config).await?;
        let (faults, fault_rx) = fault_channel(FAULT_CHANNEL_CAPACITY);
        let anomalies = Arc::new(AnomalyTracker::new(
            config.anomaly.tracker_config(),
            clock.clone(),
            Arc::new(faults.clone()),
        ));
        let store = Arc::new(store.with_anomaly_tracker(anomalies.clone()));
        reconcile_writer_key(&registry, &custody).await?;
        let author = EventAuthor::new(store.clone(), custody.clone(), clock.clone())
            .with_max_resubmits(config.ledger.max_resubmits);

        // ── Halt ────────────────────────────────────────────────────────
        let flag: Arc<dyn DurableFlag> = if durable {
            Arc::new(FileFlag::new(&config.data_dir)?)
        } else {
            Arc::new(MemoryFlag::new())
        };
        let halt = Arc::new(
            HaltController::open(config.halt.clone(), Arc::new(WatchChannel::new()), flag, author.clone())
                .await?
                .with_anomaly_tracker(anomalies.clone()),
        );
        let fault_listener = halt.spawn_fault_listener(fault_rx);

        // ── Ceremonies ──────────────────────────────────────────────────
        let audit_store: Arc<dyn AuditStore> = if durable {
            Arc::new(FileAuditStore::open(&config.data_dir).await?)
        } else {
            Arc::new(MemoryAuditStore::new())
        };
        let audit = AuditLog::open(audit_store, custody.clone(), clock.clone()).await?;

        let approvers = Arc::new(ApproverRegistry::new());
        let mut diversity = WitnessDiversity::new();
        let mut organisations = 0;
        for entry in &config.approvers {
            approvers.register(ApproverId::new(&entry.id), entry.public_key.clone(), entry.role)?;
            if let Some(org) = &entry.organisation {
                diversity = diversity.with_witness(ApproverId::new(&entry.id), org.clone());
                organisations += 1;
            }
        }

        let parameters = Arc::new(ParameterTable::new());
        store
            .replay(1, |event| {
                parameters.apply_event(event);
                Ok(())
            })
            .await?;

        let amendment: Arc<dyn CeremonyEffect> = Arc::new(AmendmentEffect::new(author.clone()));
        let effects = EffectRegistry::new()
            .with(CeremonyType::HaltClear, Arc::new(HaltClearEffect::new(halt.clone())))
            .with(
                CeremonyType::KeyRotation,
                Arc::new(KeyRotationEffect::new(author.clone(), registry.clone(), custody.clone())),
            )
            .with(
                CeremonyType::WriterFailover,
                Arc::new(FailoverEffect::new(failover, author.clone())),
            )
            .with(
                CeremonyType::ParameterChange,
                Arc::new(ParameterEffect::new(parameters.clone(), author.clone())),
            )
            .with(CeremonyType::SchemaAmendment, amendment.clone())
            .with(CeremonyType::ConstitutionalAmendment, amendment.clone())
            .with(CeremonyType::FundamentalAmendment, amendment);

        let mut engine = CeremonyEngine::new(
            config.ceremony.clone(),
            approvers,
            audit,
            author.clone(),
            halt.clone(),
            effects,
        )?;
        if organisations > 0 {
            engine = engine.with_policy(Arc::new(diversity));
        }
        let ceremonies = Arc::new(engine);
        let recovery = ceremonies.recover().await?;

        // ── Context ─────────────────────────────────────────────────────
        let bundle_store: Arc<dyn BundleStore> = if durable {
            Arc::new(FileBundleStore::open(config.data_dir.join("bundles")).await?)
        } else {
            Arc::new(MemoryBundleStore::new())
        };
        let context = ContextBuilder::new(
            config.context.clone(),
            store.clone(),
            custody.clone(),
            bundle_store,
            clock.clone(),
        );
        let bundles = BundleVerifier::new(store.clone(), registry.clone(), config.context.max_staleness_events);

        info!(
            head = %store.head().await,
            writer_key = %custody.active_key_id(),
            restored = recovery.restored,
            resumed = recovery.resumed.len(),
            deferred = recovery.deferred.len(),
            "Constitutional kernel opened"
        );
        Ok(Self {
            boundary: BoundaryHandler::new(config.escalation_contact.clone()),
            keys: KeyDirectory::new(config.key_dir()),
            config,
            clock,
            custody,
            registry,
            store,
            author,
            anomalies,
            faults,
            halt,
            ceremonies,
            parameters,
            context,
            bundles,
            heartbeat: Arc::new(HeartbeatBoard::new()),
            recovery,
            fault_listener,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn author(&self) -> &EventAuthor {
        &self.author
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn custody(&self) -> &Arc<SoftwareKeyCustody> {
        &self.custody
    }

    pub fn halt(&self) -> &Arc<HaltController> {
        &self.halt
    }

    pub fn ceremonies(&self) -> &Arc<CeremonyEngine> {
        &self.ceremonies
    }

    pub fn parameters(&self) -> &Arc<ParameterTable> {
        &self.parameters
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    pub fn bundle_verifier(&self) -> &BundleVerifier {
        &self.bundles
    }

    pub fn anomalies(&self) -> &Arc<AnomalyTracker> {
        &self.anomalies
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatBoard> {
        &self.heartbeat
    }

    /// What `recover` found when the kernel opened.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Halt check, then append a collaborator's pre-signed draft.
    ///
    /// Halt, ceremony, key and fault events are written by the kernel alone
    /// and are refused here with `SchemaViolation`.
    #[instrument(skip(self, draft), fields(sequence = draft.sequence, event_type = %draft.event_type))]
    pub async fn submit(&self, draft: EventDraft) -> KernelResult<Event> {
        self.halt.check().await?;
        let event_type = draft.payload.event_type();
        if draft.event_type.is_kernel_authored() || event_type.is_kernel_authored() {
            let err = LedgerError::SchemaViolation {
                event_type,
                reason: "reserved for kernel-authored events".into(),
            };
            let source = SourceId::new(draft.signing_key_id.0.clone());
            warn!(source = %source, event_type = %event_type, "Refused kernel-only event from collaborator");
            self.anomalies.record(&source, err.reason_code()).await;
            return Err(err.into());
        }
        Ok(self.store.append(draft).await?)
    }

    /// Halt check, then sign and append `payload` as the writer.
    pub async fn record(&self, payload: EventPayload) -> KernelResult<Event> {
        self.halt.check().await?;
        Ok(self.author.append(payload).await?)
    }

    pub async fn head(&self) -> LedgerHead {
        self.store.head().await
    }

    /// Convert `err` into what the operator sees.
    pub fn notice<E>(&self, err: &E) -> OperatorNotice
    where
        E: Classified + std::fmt::Display + ?Sized,
    {
        self.boundary.handle(err)
    }

    pub async fn status(&self) -> KernelResult<KernelStatus> {
        let active_ceremonies = self
            .ceremonies
            .active()
            .await
            .into_iter()
            .map(|c| CeremonySummary {
                approvals: c.approvers().count(),
                witnesses: c.witnesses().count(),
                id: c.id,
                ceremony_type: c.ceremony_type,
                tier: c.tier,
                state: c.state,
                requested_at: c.requested_at,
                required_approvals: c.required_approvals,
                required_witnesses: c.required_witnesses,
            })
            .collect();
        Ok(KernelStatus {
            head: self.store.head().await,
            halt: self.halt.state().await?,
            halt_degraded: self.halt.is_degraded(),
            writer_key: self.custody.active_key_id(),
            keys: self.registry.records(),
            active_ceremonies,
            parameters: self.parameters.snapshot(),
        })
    }

    // ── Keys ────────────────────────────────────────────────────────────

    /// Generate a successor key on disk and take custody of it, returning
    /// the public key to name in a `KeyRotation` ceremony.
    pub fn prepare_successor(&self, key_id: KeyId) -> KernelResult<String> {
        let public_key = self.keys.generate(&key_id)?;
        self.custody.install(key_id.clone(), self.keys.read(&key_id)?);
        info!(key_id = %key_id, "Successor key prepared");
        Ok(public_key)
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Expire overdue ceremonies and revoke rotated keys whose overlap has elapsed.
    pub async fn maintenance_once(&self) -> KernelResult<MaintenanceReport> {
        let mut report = MaintenanceReport {
            expired: self.ceremonies.sweep_expired().await?,
            ..Default::default()
        };
        if self.halt.check().await.is_err() {
            report.rotations_deferred = true;
            debug!("Key rotation finalization deferred while halted");
            return Ok(report);
        }
        for rotation in self.registry.finalize_rotations(self.clock.now()) {
            self.author
                .append(EventPayload::KeyRevoked {
                    key_id: rotation.key_id.clone(),
                    reason: "rotation overlap window elapsed".into(),
                    ceremony_id: None,
                })
                .await?;
            report.revoked.push(rotation.key_id);
        }
        Ok(report)
    }

    // ── Background tasks ────────────────────────────────────────────────

    /// Start the flag poller, ceremony sweeper, maintenance loop and
    /// heartbeat. All stop when `shutdown` flips to `true`.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.halt.clone().run_flag_poller(shutdown.clone())),
            tokio::spawn(self.ceremonies.clone().run_sweeper(shutdown.clone())),
            tokio::spawn(self.clone().run_maintenance(shutdown.clone())),
            tokio::spawn(self.clone().run_heartbeat(shutdown)),
        ]
    }

    async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.maintenance_interval_secs.max(1)));
        info!("Kernel maintenance loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.maintenance_once().await {
                        Ok(report) if !report.expired.is_empty() || !report.revoked.is_empty() => {
                            info!(expired = report.expired.len(), revoked = report.revoked.len(), "Maintenance pass");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.boundary.handle(&e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Kernel maintenance loop stopped");
    }

    async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.watchdog.interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => self.heartbeat.beat(self.clock.now()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── Liveness ────────────────────────────────────────────────────────

    /// A watchdog over `paths` that requests failover to `standby` on writer death.
    pub fn watchdog(
        &self,
        paths: Vec<Arc<dyn LivenessPath>>,
        standby: impl Into<String>,
        requested_by: ApproverId,
    ) -> KernelResult<Arc<Watchdog>> {
        let initiator = Arc::new(CeremonyFailoverInitiator::new(
            self.ceremonies.clone(),
            standby,
            requested_by,
        ));
        Ok(Arc::new(Watchdog::new(
            self.config.watchdog.clone(),
            paths,
            self.halt.clone(),
            initiator,
        )?))
    }

    /// A verifying follower of `source` whose faults reach this kernel's halt.
    pub fn replica(&self, id: SourceId, source: Arc<dyn LedgerSource>) -> Arc<LedgerReplica> {
        Arc::new(LedgerReplica::new(
            id,
            self.config.replica.clone(),
            source,
            self.registry.clone(),
            Arc::new(self.faults.clone()),
            self.clock.clone(),
        ))
    }
}

impl Drop for ConstitutionalKernel {
    fn drop(&mut self) {
        self.fault_listener.abort();
    }
}

/// Open and fully re-verify the configured ledger, rebuilding the key
/// registry from the trust anchors and the key lifecycle events.
pub async fn open_ledger(config: &KernelConfig) -> KernelResult<(LedgerStore, Arc<KeyRegistry>)> {
    let registry = Arc::new(KeyRegistry::new(Duration::seconds(config.ledger.key_overlap_secs)));
    for anchor in &config.trust_anchors {
        registry.register_trust_anchor(KeyId::new(&anchor.key_id), anchor.public_key.clone())?;
    }
    let storage: Arc<dyn EventStorage> = match config.storage.wal() {
        Some(wal) => Arc::new(WalEventStorage::open_dir(wal, config.data_dir.join("ledger")).await?),
        None => Arc::new(MemoryEventStorage::new()),
    };
    let store = LedgerStore::open(storage, registry.clone(), SchemaRegistry::standard()).await?;
    Ok((store, registry))
}

/// Make sure custody signs with a key the ledger trusts.
///
/// A rotation committed before a restart leaves the configured key
/// `Rotating`; custody then switches to the successor if it holds it.
async fn reconcile_writer_key(registry: &KeyRegistry, custody: &SoftwareKeyCustody) -> KernelResult<()> {
    let held = |record: &KeyRecord| {
        record.status == KeyStatus::Active
            && custody
                .public_key(&record.key_id)
                .map(|public| public == record.public_key)
                .unwrap_or(false)
    };
    let configured = custody.active_key_id();
    if registry.get(&configured).as_ref().is_some_and(|r| held(r)) {
        return Ok(());
    }
    let successor = registry
        .records()
        .into_iter()
        .filter(|r| held(r))
        .max_by_key(|r| r.activated_at);
    match successor {
        Some(record) => {
            warn!(configured = %configured, active = %record.key_id, "Configured writer key superseded, switching");
            custody.activate(&record.key_id).await?;
            Ok(())
        }
        None => Err(KernelError::UntrustedWriterKey(configured)),
    }
}
