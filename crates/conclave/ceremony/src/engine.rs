//! The ceremony engine.
//!
//! Drives each ceremony through the fixed transition table. Every step is
//! written to the [`AuditLog`] first, then mirrored to the ledger as a
//! `CeremonyTransitioned` event, and only then acted on. A mirror that fails
//! stays queued and is retried, in order, before the ceremony moves again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use conclave_halt::{HaltController, HaltGuard};
use conclave_ledger::EventAuthor;
use conclave_types::{
    ApproverId, CeremonyId, CeremonyState, CeremonySubject, CeremonyType, ContentHash, EventPayload,
    SharedClock,
};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::approval::{ApproverRegistry, SignedApproval};
use crate::audit::{AuditEntry, AuditLog, AuditRecord};
use crate::ceremony::Ceremony;
use crate::effect::EffectRegistry;
use crate::error::{CeremonyError, CeremonyResult};
use crate::policy::{ApprovalPolicy, CeremonyConfig, PermitAll};

const MIRROR_SCAN_BATCH: u64 = 512;

/// Outcome of [`CeremonyEngine::recover`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub restored: usize,
    /// Ceremonies found `EXECUTING` whose effect was re-run.
    pub resumed: Vec<CeremonyId>,
    /// `EXECUTING` ceremonies left for `execute` because the system is halted.
    pub deferred: Vec<CeremonyId>,
    /// Audited transitions missing from the ledger and appended on recovery.
    pub remirrored: usize,
}

/// An audited transition not yet on the ledger.
#[derive(Clone, Debug)]
struct PendingMirror {
    from: Option<CeremonyState>,
    to: CeremonyState,
    audit_record_hash: ContentHash,
}

pub struct CeremonyEngine {
    config: CeremonyConfig,
    approvers: Arc<ApproverRegistry>,
    policy: Arc<dyn ApprovalPolicy>,
    audit: AuditLog,
    author: EventAuthor,
    halt: Arc<HaltController>,
    effects: EffectRegistry,
    clock: SharedClock,
    ceremonies: DashMap<CeremonyId, Arc<Mutex<Ceremony>>>,
    unmirrored: DashMap<CeremonyId, Vec<PendingMirror>>,
    /// Serializes conflict checks against new requests.
    admission: Mutex<()>,
}

impl CeremonyEngine {
    /// Fails with `MissingEffect` unless every ceremony type has an effect.
    pub fn new(
        config: CeremonyConfig,
        approvers: Arc<ApproverRegistry>,
        audit: AuditLog,
        author: EventAuthor,
        halt: Arc<HaltController>,
        effects: EffectRegistry,
    ) -> CeremonyResult<Self> {
        effects.ensure_complete()?;
        let clock = author.clock().clone();
        Ok(Self {
            config,
            approvers,
            policy: Arc::new(PermitAll),
            audit,
            author,
            halt,
            effects,
            clock,
            ceremonies: DashMap::new(),
            unmirrored: DashMap::new(),
            admission: Mutex::new(()),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &CeremonyConfig {
        &self.config
    }

    pub fn approvers(&self) -> &Arc<ApproverRegistry> {
        &self.approvers
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Open a new ceremony in `PENDING`.
    #[instrument(skip(self, ceremony_type, subject, requested_by), fields(ceremony_type = %ceremony_type, requested_by = %requested_by.0))]
    pub async fn request(
        &self,
        ceremony_type: CeremonyType,
        subject: CeremonySubject,
        requested_by: ApproverId,
    ) -> CeremonyResult<Ceremony> {
        self.gate(ceremony_type).await?;
        if !subject.matches(ceremony_type) {
            return Err(CeremonyError::InvalidSubject(ceremony_type));
        }
        if !self.approvers.is_registered(&requested_by) {
            return Err(CeremonyError::UnknownApprover(requested_by));
        }

        let _admission = self.admission.lock().await;
        self.sweep_expired().await?;
        for instance in self.instances() {
            let active = instance.lock().await;
            if active.blocks(ceremony_type, &subject) {
                return Err(CeremonyError::CeremonyConflict {
                    requested: ceremony_type,
                    active: active.id,
                    active_type: active.ceremony_type,
                });
            }
        }

        let requirements = self
            .config
            .requirements(ceremony_type.tier(), self.approvers.pool_size());
        let mut ceremony = Ceremony::new(
            ceremony_type,
            subject,
            requested_by,
            self.clock.now(),
            &requirements,
            self.config.timeout(ceremony_type),
        );
        let record = self
            .audit
            .record(
                &ceremony,
                AuditEntry::Requested {
                    ceremony: Box::new(ceremony.clone()),
                },
            )
            .await?;
        ceremony.last_record_hash = record.record_hash;
        self.ceremonies
            .insert(ceremony.id, Arc::new(Mutex::new(ceremony.clone())));
        self.mirror(&ceremony, None, CeremonyState::Pending, record.record_hash)
            .await?;

        info!(
            ceremony_id = %ceremony.id,
            tier = %ceremony.tier,
            required_approvals = ceremony.required_approvals,
            required_witnesses = ceremony.required_witnesses,
            "Ceremony requested"
        );
        Ok(ceremony)
    }

    /// Add a signed approval. Moves the ceremony to `APPROVED` once quorum is met.
    #[instrument(skip(self, ceremony_id, approval), fields(ceremony_id = %ceremony_id, approver = %approval.approver.0))]
    pub async fn approve(
        &self,
        ceremony_id: CeremonyId,
        approval: SignedApproval,
    ) -> CeremonyResult<CeremonyState> {
        let instance = self.instance(&ceremony_id)?;
        let mut ceremony = instance.lock().await;
        self.gate(ceremony.ceremony_type).await?;
        if self.expire_if_due(&mut ceremony).await? {
            return Err(CeremonyError::Expired(ceremony_id));
        }
        match ceremony.state {
            CeremonyState::Pending | CeremonyState::Approved => {}
            CeremonyState::Expired => return Err(CeremonyError::Expired(ceremony_id)),
            other => {
                return Err(CeremonyError::InvalidTransition {
                    ceremony_id,
                    from: other,
                    to: CeremonyState::Approved,
                })
            }
        }

        self.approvers
            .verify(&approval, &ceremony.id, ceremony.ceremony_type, &ceremony.subject)?;
        if ceremony.has_approved(&approval.approver) {
            return Err(CeremonyError::DuplicateApproval(approval.approver));
        }
        self.policy
            .admit(&ceremony, &approval)
            .map_err(|reason| CeremonyError::PolicyRejected {
                approver: approval.approver.clone(),
                reason,
            })?;

        let record = self
            .audit
            .record(
                &ceremony,
                AuditEntry::Approval {
                    approval: approval.clone(),
                },
            )
            .await?;
        ceremony.approvals.push(approval);
        ceremony.last_record_hash = record.record_hash;
        debug!(
            approvals = ceremony.approvers().count(),
            witnesses = ceremony.witnesses().count(),
            "Approval recorded"
        );

        if ceremony.state == CeremonyState::Pending && ceremony.quorum_met() {
            self.transition(&mut ceremony, CeremonyState::Approved, None)
                .await?;
        }
        Ok(ceremony.state)
    }

    /// Execute an approved ceremony whose cooling period has elapsed.
    ///
    /// `EXECUTING` is durable before the effect runs. A ceremony left
    /// `EXECUTING` by an interrupted call is resumed. The returned ceremony
    /// is `COMPLETED` or `FAILED`.
    #[instrument(skip(self, ceremony_id), fields(ceremony_id = %ceremony_id))]
    pub async fn execute(&self, ceremony_id: CeremonyId) -> CeremonyResult<Ceremony> {
        let instance = self.instance(&ceremony_id)?;
        let mut ceremony = instance.lock().await;
        let guard = self.guard(ceremony.ceremony_type).await?;
        if self.expire_if_due(&mut ceremony).await? {
            return Err(CeremonyError::Expired(ceremony_id));
        }
        match ceremony.state {
            CeremonyState::Approved => {}
            CeremonyState::Executing => {
                warn!(ceremony_type = %ceremony.ceremony_type, "Resuming interrupted ceremony");
                self.run_effect(&mut ceremony, guard.as_ref()).await?;
                return Ok(ceremony.clone());
            }
            CeremonyState::Pending => {
                return Err(CeremonyError::QuorumNotMet {
                    ceremony_id,
                    approvals: ceremony.approvers().count(),
                    required_approvals: ceremony.required_approvals,
                    witnesses: ceremony.witnesses().count(),
                    required_witnesses: ceremony.required_witnesses,
                })
            }
            CeremonyState::Expired => return Err(CeremonyError::Expired(ceremony_id)),
            other => {
                return Err(CeremonyError::InvalidTransition {
                    ceremony_id,
                    from: other,
                    to: CeremonyState::Executing,
                })
            }
        }
        if !ceremony.cooling_elapsed_at(self.clock.now()) {
            return Err(CeremonyError::CoolingPeriodActive {
                ceremony_id,
                until: ceremony.cooling_until,
            });
        }

        ensure_running(guard.as_ref()).await?;
        self.transition(&mut ceremony, CeremonyState::Executing, None)
            .await?;
        self.run_effect(&mut ceremony, guard.as_ref()).await?;
        Ok(ceremony.clone())
    }

    /// Force-abort `ceremony_id` if its timeout has passed. Returns whether it expired.
    pub async fn expire(&self, ceremony_id: CeremonyId) -> CeremonyResult<bool> {
        let instance = self.instance(&ceremony_id)?;
        let mut ceremony = instance.lock().await;
        self.expire_if_due(&mut ceremony).await
    }

    /// Expire every overdue ceremony.
    pub async fn sweep_expired(&self) -> CeremonyResult<Vec<CeremonyId>> {
        let mut expired = Vec::new();
        for instance in self.instances() {
            let mut ceremony = instance.lock().await;
            if self.expire_if_due(&mut ceremony).await? {
                expired.push(ceremony.id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue ceremonies");
        }
        Ok(expired)
    }

    pub async fn status(&self, ceremony_id: CeremonyId) -> CeremonyResult<Ceremony> {
        let instance = self.instance(&ceremony_id)?;
        let mut ceremony = instance.lock().await;
        self.expire_if_due(&mut ceremony).await?;
        Ok(ceremony.clone())
    }

    pub async fn audit_trail(&self, ceremony_id: CeremonyId) -> CeremonyResult<Vec<AuditRecord>> {
        let trail = self.audit.trail(&ceremony_id).await?;
        if trail.is_empty() {
            return Err(CeremonyError::NotFound(ceremony_id));
        }
        Ok(trail)
    }

    /// Non-terminal ceremonies, oldest first.
    pub async fn active(&self) -> Vec<Ceremony> {
        let mut active = Vec::new();
        for instance in self.instances() {
            let ceremony = instance.lock().await;
            if ceremony.is_active() {
                active.push(ceremony.clone());
            }
        }
        active.sort_by_key(|c| c.requested_at);
        active
    }

    /// Rebuild every ceremony from the audit log and resume those left
    /// `EXECUTING` by re-running their effect.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> CeremonyResult<RecoveryReport> {
        let records = self.audit.records().await?;
        let mut rebuilt: Vec<Ceremony> = Vec::new();

        for record in &records {
            let corrupted = |reason: String| CeremonyError::AuditCorrupted {
                index: record.index as usize,
                reason,
            };
            if let AuditEntry::Requested { ceremony } = &record.entry {
                let mut ceremony = (**ceremony).clone();
                ceremony.last_record_hash = record.record_hash;
                rebuilt.push(ceremony);
                continue;
            }
            let Some(ceremony) = rebuilt.iter_mut().find(|c| c.id == record.ceremony_id) else {
                return Err(corrupted(format!("record for unknown ceremony {}", record.ceremony_id)));
            };
            match &record.entry {
                AuditEntry::Approval { approval } => ceremony.approvals.push(approval.clone()),
                AuditEntry::Transition { from, to, detail } => {
                    if *from != ceremony.state || !from.can_transition_to(*to) {
                        return Err(corrupted(format!(
                            "illegal transition {from} -> {to} from {}",
                            ceremony.state
                        )));
                    }
                    ceremony.state = *to;
                    if *to == CeremonyState::Failed {
                        ceremony.failure = detail.clone();
                    }
                }
                AuditEntry::Requested { .. } => {}
            }
            ceremony.last_record_hash = record.record_hash;
        }

        self.ceremonies.clear();
        self.unmirrored.clear();
        let mut report = RecoveryReport {
            restored: rebuilt.len(),
            ..Default::default()
        };

        // Audited transitions the ledger never received.
        let mirrored = self.mirrored_record_hashes().await?;
        for record in &records {
            let (from, to) = match &record.entry {
                AuditEntry::Requested { .. } => (None, CeremonyState::Pending),
                AuditEntry::Transition { from, to, .. } => (Some(*from), *to),
                AuditEntry::Approval { .. } => continue,
            };
            if !mirrored.contains(&record.record_hash) {
                self.unmirrored.entry(record.ceremony_id).or_default().push(PendingMirror {
                    from,
                    to,
                    audit_record_hash: record.record_hash,
                });
            }
        }

        let mut executing = Vec::new();
        for ceremony in rebuilt {
            let queued = self.unmirrored.get(&ceremony.id).map(|p| p.len());
            if let Some(pending) = queued {
                warn!(ceremony_id = %ceremony.id, pending, "Re-mirroring audited transitions");
                self.flush_mirrors(&ceremony).await?;
                report.remirrored += pending;
            }
            if ceremony.state == CeremonyState::Executing {
                executing.push(ceremony.id);
            }
            self.ceremonies
                .insert(ceremony.id, Arc::new(Mutex::new(ceremony)));
        }

        for ceremony_id in executing {
            let instance = self.instance(&ceremony_id)?;
            let mut ceremony = instance.lock().await;
            let guard = match self.guard(ceremony.ceremony_type).await {
                Ok(guard) => guard,
                Err(CeremonyError::Halt(e)) if e.is_halted() => {
                    warn!(ceremony_id = %ceremony_id, "Halted, interrupted ceremony left for execute");
                    report.deferred.push(ceremony_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            warn!(ceremony_id = %ceremony_id, ceremony_type = %ceremony.ceremony_type, "Resuming interrupted ceremony");
            self.run_effect(&mut ceremony, guard.as_ref()).await?;
            report.resumed.push(ceremony_id);
        }

        info!(
            restored = report.restored,
            resumed = report.resumed.len(),
            deferred = report.deferred.len(),
            remirrored = report.remirrored,
            "Ceremonies recovered"
        );
        Ok(report)
    }

    /// Periodic expiry sweep until `shutdown` flips to `true`.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.sweep_interval_secs.max(1)));
        info!(interval_secs = self.config.sweep_interval_secs, "Ceremony expiry sweeper started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        error!(error = %e, "Ceremony expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Ceremony expiry sweeper stopped");
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn gate(&self, ceremony_type: CeremonyType) -> CeremonyResult<()> {
        if ceremony_type.permitted_while_halted() {
            return Ok(());
        }
        self.halt.check().await?;
        Ok(())
    }

    /// Halt freshness for executing `ceremony_type`; `None` for types that
    /// run while halted.
    async fn guard(&self, ceremony_type: CeremonyType) -> CeremonyResult<Option<HaltGuard>> {
        if ceremony_type.permitted_while_halted() {
            return Ok(None);
        }
        let guard = HaltGuard::acquire(self.halt.clone(), self.config.halt_freshness()).await?;
        Ok(Some(guard))
    }

    fn instance(&self, ceremony_id: &CeremonyId) -> CeremonyResult<Arc<Mutex<Ceremony>>> {
        self.ceremonies
            .get(ceremony_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CeremonyError::NotFound(*ceremony_id))
    }

    /// Snapshot of instance handles, so no map guard is held across an await.
    fn instances(&self) -> Vec<Arc<Mutex<Ceremony>>> {
        self.ceremonies
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn expire_if_due(&self, ceremony: &mut Ceremony) -> CeremonyResult<bool> {
        if !ceremony.is_expired_at(self.clock.now()) {
            return Ok(false);
        }
        warn!(ceremony_id = %ceremony.id, expires_at = %ceremony.expires_at, "Ceremony timed out");
        self.transition(ceremony, CeremonyState::Expired, Some("timeout elapsed".into()))
            .await?;
        Ok(true)
    }

    /// Run the effect of an `EXECUTING` ceremony once its `EXECUTING`
    /// record is on the ledger.
    async fn run_effect(&self, ceremony: &mut Ceremony, guard: Option<&HaltGuard>) -> CeremonyResult<()> {
        let effect = self
            .effects
            .get(ceremony.ceremony_type)
            .cloned()
            .ok_or(CeremonyError::MissingEffect(ceremony.ceremony_type))?;
        self.flush_mirrors(ceremony).await?;
        ensure_running(guard).await?;
        match effect.apply(ceremony).await {
            Ok(()) => {
                self.transition(ceremony, CeremonyState::Completed, None)
                    .await?;
                info!(ceremony_id = %ceremony.id, ceremony_type = %ceremony.ceremony_type, "Ceremony completed");
            }
            Err(reason) => {
                error!(ceremony_id = %ceremony.id, reason = %reason, "Ceremony effect failed");
                ceremony.failure = Some(reason.clone());
                self.transition(ceremony, CeremonyState::Failed, Some(reason))
                    .await?;
            }
        }
        Ok(())
    }

    /// Audit, apply, then mirror one state change.
    async fn transition(
        &self,
        ceremony: &mut Ceremony,
        to: CeremonyState,
        detail: Option<String>,
    ) -> CeremonyResult<()> {
        let from = ceremony.state;
        if !from.can_transition_to(to) {
            return Err(CeremonyError::InvalidTransition {
                ceremony_id: ceremony.id,
                from,
                to,
            });
        }
        let record = self
            .audit
            .record(ceremony, AuditEntry::Transition { from, to, detail })
            .await?;
        ceremony.state = to;
        ceremony.last_record_hash = record.record_hash;
        info!(ceremony_id = %ceremony.id, from = %from, to = %to, "Ceremony transitioned");
        self.mirror(ceremony, Some(from), to, record.record_hash).await
    }

    /// Queue one audited transition for the ledger and flush the queue.
    async fn mirror(
        &self,
        ceremony: &Ceremony,
        from: Option<CeremonyState>,
        to: CeremonyState,
        audit_record_hash: ContentHash,
    ) -> CeremonyResult<()> {
        self.unmirrored.entry(ceremony.id).or_default().push(PendingMirror {
            from,
            to,
            audit_record_hash,
        });
        self.flush_mirrors(ceremony).await
    }

    /// Append every queued transition of `ceremony`, oldest first. Whatever
    /// fails stays queued.
    async fn flush_mirrors(&self, ceremony: &Ceremony) -> CeremonyResult<()> {
        let Some((_, pending)) = self.unmirrored.remove(&ceremony.id) else {
            return Ok(());
        };
        for (i, mirror) in pending.iter().enumerate() {
            let payload = EventPayload::CeremonyTransitioned {
                ceremony_id: ceremony.id,
                ceremony_type: ceremony.ceremony_type,
                tier: ceremony.tier,
                subject: ceremony.subject.clone(),
                from: mirror.from,
                to: mirror.to,
                audit_record_hash: mirror.audit_record_hash,
            };
            if let Err(e) = self.author.append(payload).await {
                error!(ceremony_id = %ceremony.id, to = %mirror.to, error = %e, "Ceremony transition not mirrored to ledger");
                self.unmirrored.insert(ceremony.id, pending[i..].to_vec());
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Audit record hashes already carried by `CeremonyTransitioned` events.
    async fn mirrored_record_hashes(&self) -> CeremonyResult<HashSet<ContentHash>> {
        let store = self.author.store();
        let head = store.head().await.sequence;
        let mut hashes = HashSet::new();
        let mut from = 1;
        while from <= head {
            let to = (from + MIRROR_SCAN_BATCH - 1).min(head);
            for event in store.read(from, to).await? {
                if let EventPayload::CeremonyTransitioned { audit_record_hash, .. } = event.payload {
                    hashes.insert(audit_record_hash);
                }
            }
            from = to + 1;
        }
        Ok(hashes)
    }
}

async fn ensure_running(guard: Option<&HaltGuard>) -> CeremonyResult<()> {
    if let Some(guard) = guard {
        guard.ensure().await?;
    }
    Ok(())
}
