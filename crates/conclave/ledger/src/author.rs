//! System-authored events.

use std::sync::Arc;

use conclave_signing::SigningService;
use conclave_types::{Event, EventDraft, EventPayload, SharedClock};
use tracing::{debug, instrument, warn};

use crate::error::LedgerError;
use crate::store::LedgerStore;

/// Builds, signs and appends events on behalf of kernel components
/// (halt, ceremony, key maintenance).
///
/// A `ChainConflict` means another writer won the race for the head. The
/// author re-reads the head, re-signs and resubmits; any other rejection is
/// returned as is.
#[derive(Clone)]
pub struct EventAuthor {
    store: Arc<LedgerStore>,
    signer: Arc<dyn SigningService>,
    clock: SharedClock,
    max_resubmits: u32,
}

impl EventAuthor {
    pub fn new(store: Arc<LedgerStore>, signer: Arc<dyn SigningService>, clock: SharedClock) -> Self {
        Self {
            store,
            signer,
            clock,
            max_resubmits: 3,
        }
    }

    pub fn with_max_resubmits(mut self, max_resubmits: u32) -> Self {
        self.max_resubmits = max_resubmits;
        self
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn signer(&self) -> &Arc<dyn SigningService> {
        &self.signer
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Sign `payload` against the current head and append it.
    #[instrument(skip(self, payload), fields(event_type = %payload.event_type()))]
    pub async fn append(&self, payload: EventPayload) -> Result<Event, LedgerError> {
        let version = self.store.schemas().current_version(payload.event_type())?;
        let mut attempt = 0u32;
        loop {
            let head = self.store.head().await;
            let draft = EventDraft::unsigned(&head, payload.clone(), version, self.clock.now());
            let (signature, key_id) = self.signer.sign(&draft.signable_bytes()?).await?;

            match self.store.append(draft.signed(signature, key_id)).await {
                Ok(event) => return Ok(event),
                Err(LedgerError::ChainConflict { head_sequence, .. })
                    if attempt < self.max_resubmits =>
                {
                    attempt += 1;
                    debug!(head_sequence, attempt, "Head moved, re-signing");
                }
                Err(e) => {
                    warn!(error = %e, "System event rejected");
                    return Err(e);
                }
            }
        }
    }
}
