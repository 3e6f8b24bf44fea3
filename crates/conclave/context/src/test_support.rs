use std::sync::Arc;

use conclave_ledger::{EventAuthor, LedgerStore, MemoryEventStorage, SchemaRegistry};
use conclave_signing::{KeyRegistry, SigningService, SoftwareKeyCustody};
use conclave_types::{ContentHash, EventPayload, KeyId, ManualClock};

pub(crate) async fn ledger() -> (EventAuthor, Arc<KeyRegistry>) {
    ledger_as("writer-1").await
}

pub(crate) async fn ledger_as(key: &str) -> (EventAuthor, Arc<KeyRegistry>) {
    let custody = Arc::new(SoftwareKeyCustody::generate(KeyId::new(key)));
    let registry = Arc::new(KeyRegistry::new(chrono::Duration::hours(1)));
    registry
        .register_trust_anchor(KeyId::new(key), custody.public_key(&KeyId::new(key)).unwrap())
        .unwrap();
    let store = LedgerStore::open(
        Arc::new(MemoryEventStorage::new()),
        registry.clone(),
        SchemaRegistry::standard(),
    )
    .await
    .unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    (EventAuthor::new(Arc::new(store), custody, clock), registry)
}

pub(crate) async fn record_state(author: &EventAuthor, subject: &str, times: u32) {
    for i in 0..times {
        author
            .append(EventPayload::StateRecorded {
                subject: subject.into(),
                state_kind: "vote_tally".into(),
                state_hash: ContentHash::hash(format!("{subject}/{i}").as_bytes()),
            })
            .await
            .unwrap();
    }
}

/// Returns the content hash of the `PrecedentEstablished` event.
pub(crate) async fn record_precedent(author: &EventAuthor, precedent_id: &str) -> ContentHash {
    author
        .append(EventPayload::PrecedentEstablished {
            precedent_id: precedent_id.into(),
            summary_hash: ContentHash::hash(precedent_id.as_bytes()),
        })
        .await
        .unwrap()
        .content_hash
}
