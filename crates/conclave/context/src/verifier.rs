//! Pre-use verification of context bundles.

use std::sync::Arc;

use conclave_ledger::LedgerSource;
use conclave_signing::SignatureVerifier;
use tracing::warn;

use crate::builder::Derivation;
use crate::bundle::ContextBundle;
use crate::error::{ContextError, ContextResult};

pub struct BundleVerifier {
    source: Arc<dyn LedgerSource>,
    keys: Arc<dyn SignatureVerifier>,
    max_staleness_events: u64,
    read_batch: u64,
}

impl BundleVerifier {
    pub fn new(source: Arc<dyn LedgerSource>, keys: Arc<dyn SignatureVerifier>, max_staleness_events: u64) -> Self {
        Self {
            source,
            keys,
            max_staleness_events,
            read_batch: 256,
        }
    }

    /// Check hash and signature, then anchor the bundle to the canonical chain.
    pub async fn verify(&self, bundle: &ContextBundle) -> ContextResult<()> {
        let tampered = |reason: String| ContextError::BundleTampered {
            bundle_id: bundle.bundle_id,
            reason,
        };
        if bundle.compute_hash()? != bundle.bundle_hash {
            return Err(tampered("bundle hash mismatch".into()));
        }
        self.keys
            .verify(
                &bundle.signing_key_id,
                bundle.bundle_hash.as_bytes(),
                &bundle.signature,
                bundle.created_at,
            )
            .map_err(|e| tampered(format!("signature: {e}")))?;

        let head = self.source.head().await?;
        let stale = |reason: String| ContextError::StaleContext {
            bundle_id: bundle.bundle_id,
            as_of_sequence: bundle.as_of_sequence,
            head: head.sequence,
            reason,
        };
        if bundle.as_of_sequence > head.sequence {
            return Err(ContextError::SequenceNotFound {
                sequence: bundle.as_of_sequence,
                head: head.sequence,
            });
        }
        if bundle.as_of_sequence > 0 {
            let anchor = self
                .source
                .read(bundle.as_of_sequence, bundle.as_of_sequence)
                .await?
                .into_iter()
                .next()
                .ok_or(ContextError::SequenceNotFound {
                    sequence: bundle.as_of_sequence,
                    head: head.sequence,
                })?;
            if anchor.content_hash != bundle.as_of_hash {
                warn!(bundle_id = %bundle.bundle_id, "Bundle anchor hash differs from canonical chain");
                return Err(stale("as_of_hash differs from the canonical chain".into()));
            }
        } else if !bundle.as_of_hash.is_zero() {
            return Err(stale("empty-ledger bundle with a non-zero anchor".into()));
        }

        let behind = head.sequence - bundle.as_of_sequence;
        if behind > self.max_staleness_events {
            return Err(stale(format!(
                "{behind} events behind head, limit {}",
                self.max_staleness_events
            )));
        }
        Ok(())
    }

    /// Re-derive the bundle's references from the ledger and compare.
    pub async fn verify_derivation(&self, bundle: &ContextBundle) -> ContextResult<()> {
        let derived = Derivation::fold(self.source.as_ref(), bundle.as_of_sequence, self.read_batch).await?;
        if derived != Derivation::of(bundle) {
            return Err(ContextError::BundleTampered {
                bundle_id: bundle.bundle_id,
                reason: "references do not match the ledger at as_of_sequence".into(),
            });
        }
        Ok(())
    }
}
