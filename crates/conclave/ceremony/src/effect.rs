//! Ceremony side effects.
//!
//! One [`CeremonyEffect`] per ceremony type. Effects run after the
//! `EXECUTING` record is durable and may be re-run by recovery, so each one
//! checks whether its work is already done.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conclave_halt::{CeremonyRef, HaltController, HaltError};
use conclave_ledger::{EventAuthor, LedgerError};
use conclave_signing::{KeyRegistry, SigningService};
use conclave_types::{CeremonyState, CeremonySubject, CeremonyType, ContentHash, Event, EventPayload};
use dashmap::DashMap;
use tracing::info;

use crate::ceremony::Ceremony;
use crate::error::{CeremonyError, CeremonyResult};

const LEDGER_SCAN_BATCH: u64 = 256;

#[async_trait]
pub trait CeremonyEffect: Send + Sync {
    /// Apply the ceremony. Must be idempotent.
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String>;
}

#[derive(Clone, Default)]
pub struct EffectRegistry {
    effects: HashMap<CeremonyType, Arc<dyn CeremonyEffect>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ceremony_type: CeremonyType, effect: Arc<dyn CeremonyEffect>) -> Self {
        self.effects.insert(ceremony_type, effect);
        self
    }

    pub fn register(&mut self, ceremony_type: CeremonyType, effect: Arc<dyn CeremonyEffect>) {
        self.effects.insert(ceremony_type, effect);
    }

    pub fn get(&self, ceremony_type: CeremonyType) -> Option<&Arc<dyn CeremonyEffect>> {
        self.effects.get(&ceremony_type)
    }

    /// Fail if any ceremony type has no effect.
    pub fn ensure_complete(&self) -> CeremonyResult<()> {
        match CeremonyType::ALL.iter().find(|ty| !self.effects.contains_key(ty)) {
            Some(missing) => Err(CeremonyError::MissingEffect(*missing)),
            None => Ok(()),
        }
    }
}

/// Whether the ledger already holds an event matching `found`, newest first.
async fn recorded(author: &EventAuthor, found: impl Fn(&EventPayload) -> bool) -> Result<bool, LedgerError> {
    let store = author.store();
    let mut to = store.head().await.sequence;
    while to > 0 {
        let from = to.saturating_sub(LEDGER_SCAN_BATCH - 1).max(1);
        if store.read(from, to).await?.iter().rev().any(|e| found(&e.payload)) {
            return Ok(true);
        }
        to = from - 1;
    }
    Ok(false)
}

fn wrong_subject(ceremony: &Ceremony) -> String {
    format!("subject does not fit {}", ceremony.ceremony_type)
}

// ── Halt clear ──────────────────────────────────────────────────────────

pub struct HaltClearEffect {
    halt: Arc<HaltController>,
}

impl HaltClearEffect {
    pub fn new(halt: Arc<HaltController>) -> Self {
        Self { halt }
    }
}

#[async_trait]
impl CeremonyEffect for HaltClearEffect {
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String> {
        let CeremonySubject::Halt { halt_id } = &ceremony.subject else {
            return Err(wrong_subject(ceremony));
        };
        match self
            .halt
            .clear(&CeremonyRef {
                ceremony_id: ceremony.id,
                halt_id: *halt_id,
            })
            .await
        {
            Ok(()) => Ok(()),
            // Already cleared by an earlier run.
            Err(HaltError::NotHalted) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

// ── Key rotation ────────────────────────────────────────────────────────

/// Records the successor's `KeyActivated` (which starts the overlap window)
/// and switches custody to it. The predecessor is revoked later by
/// [`KeyRegistry::finalize_rotations`].
pub struct KeyRotationEffect {
    author: EventAuthor,
    registry: Arc<KeyRegistry>,
    custody: Arc<dyn SigningService>,
}

impl KeyRotationEffect {
    pub fn new(author: EventAuthor, registry: Arc<KeyRegistry>, custody: Arc<dyn SigningService>) -> Self {
        Self {
            author,
            registry,
            custody,
        }
    }
}

#[async_trait]
impl CeremonyEffect for KeyRotationEffect {
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String> {
        let CeremonySubject::KeyRotation {
            retiring,
            successor,
            successor_public_key,
        } = &ceremony.subject
        else {
            return Err(wrong_subject(ceremony));
        };

        let held = self.custody.public_key(successor).map_err(|e| e.to_string())?;
        if &held != successor_public_key {
            return Err(format!("custody holds a different key for {successor}"));
        }

        let registered = self
            .registry
            .get(successor)
            .is_some_and(|r| &r.public_key == successor_public_key);
        if !registered {
            self.author
                .append(EventPayload::KeyActivated {
                    key_id: successor.clone(),
                    public_key: successor_public_key.clone(),
                    supersedes: Some(retiring.clone()),
                    ceremony_id: Some(ceremony.id),
                })
                .await
                .map_err(|e| e.to_string())?;
        }

        self.custody.activate(successor).await.map_err(|e| e.to_string())?;
        info!(retiring = %retiring, successor = %successor, "Signing key rotated");
        Ok(())
    }
}

// ── Writer failover ─────────────────────────────────────────────────────

/// Promotes a new canonical writer. Must be idempotent.
#[async_trait]
pub trait FailoverHandler: Send + Sync {
    async fn promote(&self, previous_writer: &str, new_writer: &str) -> Result<(), String>;
}

pub struct FailoverEffect {
    handler: Arc<dyn FailoverHandler>,
    author: EventAuthor,
}

impl FailoverEffect {
    pub fn new(handler: Arc<dyn FailoverHandler>, author: EventAuthor) -> Self {
        Self { handler, author }
    }
}

#[async_trait]
impl CeremonyEffect for FailoverEffect {
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String> {
        let CeremonySubject::WriterFailover {
            previous_writer,
            new_writer,
        } = &ceremony.subject
        else {
            return Err(wrong_subject(ceremony));
        };
        self.handler.promote(previous_writer, new_writer).await?;

        let id = ceremony.id;
        let done = recorded(&self.author, |p| {
            matches!(p, EventPayload::WriterFailover { ceremony_id, .. } if *ceremony_id == id)
        })
        .await
        .map_err(|e| e.to_string())?;
        if !done {
            self.author
                .append(EventPayload::WriterFailover {
                    ceremony_id: id,
                    previous_writer: previous_writer.clone(),
                    new_writer: new_writer.clone(),
                })
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

// ── Amendments ──────────────────────────────────────────────────────────

pub struct AmendmentEffect {
    author: EventAuthor,
}

impl AmendmentEffect {
    pub fn new(author: EventAuthor) -> Self {
        Self { author }
    }
}

#[async_trait]
impl CeremonyEffect for AmendmentEffect {
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String> {
        let CeremonySubject::Amendment { title, text_hash } = &ceremony.subject else {
            return Err(wrong_subject(ceremony));
        };
        let id = ceremony.id;
        let done = recorded(&self.author, |p| {
            matches!(p, EventPayload::AmendmentRatified { ceremony_id, .. } if *ceremony_id == id)
        })
        .await
        .map_err(|e| e.to_string())?;
        if done {
            return Ok(());
        }
        self.author
            .append(EventPayload::AmendmentRatified {
                ceremony_id: id,
                amendment_kind: ceremony.ceremony_type,
                title: title.clone(),
                text_hash: *text_hash,
            })
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

// ── Parameters ──────────────────────────────────────────────────────────

/// Operational parameters changed by Tier 1 ceremonies.
#[derive(Default)]
pub struct ParameterTable {
    values: DashMap<String, String>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| v.clone())
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort();
        all
    }

    /// Fold a committed event; completed parameter ceremonies set their value.
    pub fn apply_event(&self, event: &Event) {
        if let EventPayload::CeremonyTransitioned {
            subject: CeremonySubject::Parameter { name, value },
            to: CeremonyState::Completed,
            ..
        } = &event.payload
        {
            self.values.insert(name.clone(), value.clone());
        }
    }
}

pub struct ParameterEffect {
    table: Arc<ParameterTable>,
    author: EventAuthor,
}

impl ParameterEffect {
    pub fn new(table: Arc<ParameterTable>, author: EventAuthor) -> Self {
        Self { table, author }
    }
}

#[async_trait]
impl CeremonyEffect for ParameterEffect {
    async fn apply(&self, ceremony: &Ceremony) -> Result<(), String> {
        let CeremonySubject::Parameter { name, value } = &ceremony.subject else {
            return Err(wrong_subject(ceremony));
        };
        if self.table.get(name).as_ref() == Some(value) {
            return Ok(());
        }
        self.author
            .append(EventPayload::StateRecorded {
                subject: format!("parameter:{name}"),
                state_kind: "parameter".into(),
                state_hash: ContentHash::hash(value.as_bytes()),
            })
            .await
            .map_err(|e| e.to_string())?;
        self.table.values.insert(name.clone(), value.clone());
        info!(parameter = %name, "Parameter changed by ceremony");
        Ok(())
    }
}
