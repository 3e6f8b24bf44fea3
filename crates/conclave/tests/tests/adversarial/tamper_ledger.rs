//! Adversarial test: events altered at rest or forged in transit are
//! detected, and repeated forgeries halt the system.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use conclave_kernel::KernelError;
use conclave_ledger::{EventStorage, LedgerError, LedgerStore, MemoryEventStorage, SchemaRegistry};
use conclave_signing::{crypto, KeyRegistry, SigningService, SoftwareKeyCustody};
use conclave_tests::{fill, vote_tally, Harness};
use conclave_types::{
    Clock, ContentHash, Event, EventDraft, EventPayload, KeyId, SignatureBytes, SystemClock,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Serves one stored event rewritten by `tamper`.
struct TamperedStorage {
    inner: MemoryEventStorage,
    target: u64,
    tamper: fn(&mut Event),
}

impl TamperedStorage {
    fn rewrite(&self, mut event: Event) -> Event {
        if event.sequence == self.target {
            (self.tamper)(&mut event);
        }
        event
    }
}

#[async_trait]
impl EventStorage for TamperedStorage {
    async fn insert(&self, event: &Event) -> Result<(), LedgerError> {
        self.inner.insert(event).await
    }

    async fn get(&self, sequence: u64) -> Result<Option<Event>, LedgerError> {
        Ok(self.inner.get(sequence).await?.map(|e| self.rewrite(e)))
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<Event>, LedgerError> {
        Ok(self
            .inner
            .range(from, to)
            .await?
            .into_iter()
            .map(|e| self.rewrite(e))
            .collect())
    }

    async fn last(&self) -> Result<Option<Event>, LedgerError> {
        Ok(self.inner.last().await?.map(|e| self.rewrite(e)))
    }
}

fn registry_for(custody: &SoftwareKeyCustody) -> Arc<KeyRegistry> {
    let registry = Arc::new(KeyRegistry::new(Duration::hours(1)));
    let key_id = custody.active_key_id();
    registry
        .register_trust_anchor(key_id.clone(), custody.public_key(&key_id).unwrap())
        .unwrap();
    registry
}

/// A six-event chain in plain memory storage.
async fn honest_chain(custody: &SoftwareKeyCustody) -> MemoryEventStorage {
    let storage = MemoryEventStorage::new();
    let mut head = conclave_types::LedgerHead::genesis();
    for n in 0..6u64 {
        let draft = EventDraft::unsigned(&head, vote_tally("9", n), 1, SystemClock.now());
        let (signature, key_id) = custody.sign(&draft.signable_bytes().unwrap()).await.unwrap();
        let draft = draft.signed(signature, key_id);
        let event = Event::from_draft(draft.clone(), draft.content_hash().unwrap());
        storage.insert(&event).await.unwrap();
        head = event.as_head();
    }
    storage
}

async fn reopen_with(tamper: fn(&mut Event)) -> LedgerError {
    let custody = SoftwareKeyCustody::generate(KeyId::new("writer-1"));
    let storage = TamperedStorage {
        inner: honest_chain(&custody).await,
        target: 3,
        tamper,
    };
    LedgerStore::open(Arc::new(storage), registry_for(&custody), SchemaRegistry::standard())
        .await
        .err()
        .expect("tampered ledger must not open")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn altered_payload_detected_on_open() {
    let err = reopen_with(|event| {
        event.payload = vote_tally("9", 777);
    })
    .await;
    assert!(matches!(err, LedgerError::BrokenChain { sequence: 3, .. }));
}

#[tokio::test]
async fn rehashed_payload_still_fails_signature_and_link() {
    let err = reopen_with(|event| {
        event.timestamp += Duration::seconds(1);
        event.content_hash = ContentHash::hash(b"recomputed by the attacker");
    })
    .await;
    assert!(matches!(err, LedgerError::BrokenChain { sequence: 3, .. }));
}

#[tokio::test]
async fn resigned_with_foreign_key_detected() {
    let err = reopen_with(|event| {
        let foreign = crypto::generate_signing_key();
        event.signature = crypto::sign_with(&foreign, event.content_hash.as_bytes());
    })
    .await;
    assert!(matches!(err, LedgerError::BrokenChain { sequence: 3, .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_forgeries_halt_the_system() {
    let mut harness = Harness::in_memory().await;
    harness.config.anomaly.threshold = 3;
    let kernel = harness.open().await;
    fill(&kernel, 2).await;

    for n in 0..3u8 {
        let draft = EventDraft::unsigned(
            &kernel.head().await,
            EventPayload::IdentityDeclared {
                subject: "impostor".into(),
                identity_hash: ContentHash::hash(&[n]),
            },
            1,
            kernel.clock().now(),
        )
        .signed(SignatureBytes::new(vec![n; 64]), KeyId::new("intruder"));
        let err = kernel.submit(draft).await.unwrap_err();
        assert!(matches!(err, KernelError::Ledger(LedgerError::InvalidSignature { .. })));
        assert!(kernel.notice(&err).escalation_contact.is_some());
    }

    let mut halted = false;
    for _ in 0..100 {
        if kernel.halt().state().await.unwrap().is_halted() {
            halted = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert!(halted, "anomaly threshold should raise a halt");
    let record = kernel.halt().current_halt().await.unwrap();
    assert_eq!(record.source.0, "intruder");
    assert!(kernel.store().verify_chain(1, kernel.head().await.sequence).await.unwrap());
}
