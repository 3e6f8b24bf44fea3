//! Read-only views over a data directory.
//!
//! Nothing here needs the writer key or takes the writer role, so it is safe
//! to run next to a live kernel.

use std::collections::HashMap;

use conclave_ceremony::audit::{verify_chain, verify_signatures};
use conclave_ceremony::{AuditEntry, AuditRecord, AuditStore, Ceremony, FileAuditStore, ParameterTable};
use conclave_halt::{DurableFlag, FileFlag, HaltState};
use conclave_ledger::ChainReport;
use conclave_signing::KeyRegistry;
use conclave_types::{CeremonyId, KeyId, KeyStatus, LedgerHead};
use serde::Serialize;

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::kernel::{open_ledger, CeremonySummary, KernelStatus};

#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    pub head: LedgerHead,
    pub chain: ChainReport,
    /// Audit records checked, `None` without durable storage.
    pub audit_records: Option<usize>,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.chain.is_intact()
    }
}

/// Re-verify the ledger between `from` and `to` (default: head) and the
/// ceremony audit log.
///
/// Opening the ledger already re-verifies every signature and link; a break
/// anywhere fails here with `BrokenChain` before a report is produced.
pub async fn verify(config: &KernelConfig, from: u64, to: Option<u64>) -> KernelResult<VerifyReport> {
    let (store, registry) = open_ledger(config).await?;
    let head = store.head().await;
    let chain = match head.sequence {
        0 => ChainReport::default(),
        _ => store.integrity_report(from, to.unwrap_or(head.sequence)).await?,
    };
    let audit_records = match load_audit(config).await? {
        Some(records) => {
            verify_chain(&records)?;
            verify_signatures(&records, registry.as_ref())?;
            Some(records.len())
        }
        None => None,
    };
    Ok(VerifyReport {
        head,
        chain,
        audit_records,
    })
}

/// Kernel status reconstructed from disk.
pub async fn status(config: &KernelConfig) -> KernelResult<KernelStatus> {
    let (store, registry) = open_ledger(config).await?;

    let parameters = ParameterTable::new();
    store
        .replay(1, |event| {
            parameters.apply_event(event);
            Ok(())
        })
        .await?;

    let halt = if config.storage.is_durable() {
        FileFlag::new(&config.data_dir)?.load().await?
    } else {
        HaltState::Running
    };

    let mut active_ceremonies: Vec<CeremonySummary> = match load_audit(config).await? {
        Some(records) => fold_ceremonies(&records)
            .into_values()
            .filter(Ceremony::is_active)
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
            .collect(),
        None => Vec::new(),
    };
    active_ceremonies.sort_by_key(|c| c.requested_at);

    Ok(KernelStatus {
        head: store.head().await,
        halt,
        halt_degraded: false,
        writer_key: current_writer_key(config, &registry),
        keys: registry.records(),
        active_ceremonies,
        parameters: parameters.snapshot(),
    })
}

async fn load_audit(config: &KernelConfig) -> KernelResult<Option<Vec<AuditRecord>>> {
    if !config.storage.is_durable() || !config.data_dir.join(FileAuditStore::FILE_NAME).exists() {
        return Ok(None);
    }
    let store = FileAuditStore::open(&config.data_dir).await?;
    Ok(Some(store.load().await?))
}

fn fold_ceremonies(records: &[AuditRecord]) -> HashMap<CeremonyId, Ceremony> {
    let mut ceremonies: HashMap<CeremonyId, Ceremony> = HashMap::new();
    for record in records {
        match &record.entry {
            AuditEntry::Requested { ceremony } => {
                ceremonies.insert(record.ceremony_id, ceremony.as_ref().clone());
            }
            AuditEntry::Approval { approval } => {
                if let Some(c) = ceremonies.get_mut(&record.ceremony_id) {
                    c.approvals.push(approval.clone());
                }
            }
            AuditEntry::Transition { to, .. } => {
                if let Some(c) = ceremonies.get_mut(&record.ceremony_id) {
                    c.state = *to;
                }
            }
        }
    }
    ceremonies
}

/// The newest active key, falling back to the configured one.
fn current_writer_key(config: &KernelConfig, registry: &KeyRegistry) -> KeyId {
    registry
        .records()
        .into_iter()
        .filter(|r| r.status == KeyStatus::Active)
        .max_by_key(|r| r.activated_at)
        .map(|r| r.key_id)
        .unwrap_or_else(|| KeyId::new(&config.signing.key_id))
}
