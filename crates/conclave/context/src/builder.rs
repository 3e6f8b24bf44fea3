//! Bundle assembly.

use std::collections::BTreeMap;
use std::sync::Arc;

use conclave_ledger::LedgerSource;
use conclave_signing::SigningService;
use conclave_types::{BundleId, ContentHash, Event, EventPayload, KeyId, SessionId, SharedClock, SignatureBytes};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::bundle::{ContextBundle, PrecedentRef, StateRef};
use crate::error::{ContextError, ContextResult};
use crate::store::BundleStore;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// How far the head may move past a bundle before it is stale.
    pub max_staleness_events: u64,
    /// Events per ledger read while folding.
    pub read_batch: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_staleness_events: 100,
            read_batch: 256,
        }
    }
}

/// Everything a bundle references, folded from events `1..=as_of_sequence`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Derivation {
    pub as_of_sequence: u64,
    pub as_of_hash: ContentHash,
    pub identity_ref: Option<ContentHash>,
    pub state_refs: Vec<StateRef>,
    pub precedent_refs: Vec<PrecedentRef>,
}

impl Derivation {
    /// Fold the ledger up to `as_of`. Fails with `SequenceNotFound` if the
    /// source cannot produce every event in range.
    pub(crate) async fn fold(source: &dyn LedgerSource, as_of: u64, batch: u64) -> ContextResult<Self> {
        let head = source.head().await?;
        if as_of > head.sequence {
            return Err(ContextError::SequenceNotFound {
                sequence: as_of,
                head: head.sequence,
            });
        }

        let mut identity_ref = None;
        let mut states: BTreeMap<String, StateRef> = BTreeMap::new();
        let mut precedents = Vec::new();
        let mut as_of_hash = ContentHash::zero();

        let batch = batch.max(1);
        let mut from = 1;
        while from <= as_of {
            let to = (from + batch - 1).min(as_of);
            let events = source.read(from, to).await?;
            if events.len() as u64 != to - from + 1 {
                return Err(ContextError::SequenceNotFound {
                    sequence: from + events.len() as u64,
                    head: head.sequence,
                });
            }
            for event in &events {
                fold_event(event, &mut identity_ref, &mut states, &mut precedents);
                as_of_hash = event.content_hash;
            }
            from = to + 1;
        }

        precedents.sort_by(|a: &PrecedentRef, b| {
            a.precedent_id
                .cmp(&b.precedent_id)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(Self {
            as_of_sequence: as_of,
            as_of_hash,
            identity_ref,
            state_refs: states.into_values().collect(),
            precedent_refs: precedents,
        })
    }

    pub(crate) fn of(bundle: &ContextBundle) -> Self {
        Self {
            as_of_sequence: bundle.as_of_sequence,
            as_of_hash: bundle.as_of_hash,
            identity_ref: bundle.identity_ref,
            state_refs: bundle.state_refs.clone(),
            precedent_refs: bundle.precedent_refs.clone(),
        }
    }
}

fn fold_event(
    event: &Event,
    identity_ref: &mut Option<ContentHash>,
    states: &mut BTreeMap<String, StateRef>,
    precedents: &mut Vec<PrecedentRef>,
) {
    match &event.payload {
        EventPayload::IdentityDeclared { .. } => *identity_ref = Some(event.content_hash),
        EventPayload::StateRecorded {
            subject, state_kind, ..
        } => {
            states.insert(
                subject.clone(),
                StateRef {
                    subject: subject.clone(),
                    state_kind: state_kind.clone(),
                    event_hash: event.content_hash,
                    sequence: event.sequence,
                },
            );
        }
        EventPayload::PrecedentEstablished { precedent_id, .. } => precedents.push(PrecedentRef {
            precedent_id: precedent_id.clone(),
            event_hash: event.content_hash,
            sequence: event.sequence,
        }),
        _ => {}
    }
}

pub struct ContextBuilder {
    config: ContextConfig,
    source: Arc<dyn LedgerSource>,
    signer: Arc<dyn SigningService>,
    store: Arc<dyn BundleStore>,
    clock: SharedClock,
}

impl ContextBuilder {
    pub fn new(
        config: ContextConfig,
        source: Arc<dyn LedgerSource>,
        signer: Arc<dyn SigningService>,
        store: Arc<dyn BundleStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            source,
            signer,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build, sign and store a bundle for `session_id`.
    ///
    /// Without `up_to` the head is read once and fixed as `as_of_sequence`;
    /// nothing after it is consulted.
    #[instrument(skip(self, session_id), fields(session = %session_id))]
    pub async fn build(&self, session_id: SessionId, up_to: Option<u64>) -> ContextResult<ContextBundle> {
        let as_of = match up_to {
            Some(sequence) => sequence,
            None => self.source.head().await?.sequence,
        };
        let derivation = Derivation::fold(self.source.as_ref(), as_of, self.config.read_batch).await?;

        let mut bundle = ContextBundle {
            bundle_id: BundleId::new(),
            session_id,
            as_of_sequence: derivation.as_of_sequence,
            as_of_hash: derivation.as_of_hash,
            identity_ref: derivation.identity_ref,
            state_refs: derivation.state_refs,
            precedent_refs: derivation.precedent_refs,
            created_at: self.clock.now(),
            bundle_hash: ContentHash::zero(),
            signature: SignatureBytes::default(),
            signing_key_id: KeyId::new(""),
        };
        bundle.bundle_hash = bundle.compute_hash()?;
        let (signature, key_id) = self.signer.sign(bundle.bundle_hash.as_bytes()).await?;
        bundle.signature = signature;
        bundle.signing_key_id = key_id;

        self.store
            .put(bundle.bundle_id, serde_json::to_vec(&bundle)?)
            .await?;
        info!(
            bundle_id = %bundle.bundle_id,
            as_of_sequence = bundle.as_of_sequence,
            states = bundle.state_refs.len(),
            precedents = bundle.precedent_refs.len(),
            "Context bundle built"
        );
        Ok(bundle)
    }

    /// The stored bytes, exactly as written at build time.
    pub async fn fetch_bytes(&self, bundle_id: &BundleId) -> ContextResult<Arc<[u8]>> {
        self.store
            .get(bundle_id)
            .await?
            .ok_or(ContextError::BundleNotFound(*bundle_id))
    }

    pub async fn fetch(&self, bundle_id: &BundleId) -> ContextResult<ContextBundle> {
        let bytes = self.fetch_bytes(bundle_id).await?;
        debug!(bundle_id = %bundle_id, bytes = bytes.len(), "Context bundle fetched");
        Ok(serde_json::from_slice(&bytes)?)
    }
}
