//! Property tests: any sequence of appends forms an unbroken hash chain,
//! and re-walking it from genesis reproduces the head.

use std::sync::Arc;

use chrono::Duration;
use conclave_ledger::{EventAuthor, EventStorage, LedgerStore, MemoryEventStorage, SchemaRegistry};
use conclave_signing::{KeyRegistry, SigningService, SoftwareKeyCustody};
use conclave_types::{ContentHash, EventPayload, KeyId, SystemClock};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Collaborator payloads, the open part of the catalogue.
fn arb_payload() -> impl Strategy<Value = EventPayload> {
    prop_oneof![
        ("[a-z]{1,12}", any::<[u8; 8]>()).prop_map(|(subject, seed)| EventPayload::IdentityDeclared {
            subject,
            identity_hash: ContentHash::hash(&seed),
        }),
        ("[a-z]{1,12}", "[a-z_]{1,10}", any::<[u8; 8]>()).prop_map(|(subject, state_kind, seed)| {
            EventPayload::StateRecorded {
                subject,
                state_kind,
                state_hash: ContentHash::hash(&seed),
            }
        }),
        ("[A-Z]{2}-[0-9]{1,4}", any::<[u8; 8]>()).prop_map(|(precedent_id, seed)| {
            EventPayload::PrecedentEstablished {
                precedent_id,
                summary_hash: ContentHash::hash(&seed),
            }
        }),
    ]
}

fn trusted_writer() -> (Arc<SoftwareKeyCustody>, Arc<KeyRegistry>) {
    let custody = Arc::new(SoftwareKeyCustody::generate(KeyId::new("writer-1")));
    let registry = Arc::new(KeyRegistry::new(Duration::hours(1)));
    registry
        .register_trust_anchor(KeyId::new("writer-1"), custody.public_key(&KeyId::new("writer-1")).unwrap())
        .unwrap();
    (custody, registry)
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every event links to its predecessor and carries a correct content hash.
    #[test]
    fn appends_form_a_linked_chain(payloads in prop::collection::vec(arb_payload(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (custody, registry) = trusted_writer();
            let storage = Arc::new(MemoryEventStorage::new());
            let store = Arc::new(
                LedgerStore::open(storage.clone(), registry.clone(), SchemaRegistry::standard())
                    .await
                    .unwrap(),
            );
            let author = EventAuthor::new(store.clone(), custody, Arc::new(SystemClock));
            for payload in &payloads {
                author.append(payload.clone()).await.unwrap();
            }

            let events = storage.range(1, payloads.len() as u64).await.unwrap();
            assert_eq!(events.len(), payloads.len());
            let mut previous = ContentHash::zero();
            for (i, event) in events.iter().enumerate() {
                assert_eq!(event.sequence, i as u64 + 1);
                assert_eq!(event.previous_hash, previous);
                assert!(event.verify_content_hash());
                assert_eq!(&event.payload, &payloads[i]);
                previous = event.content_hash;
            }
            assert_eq!(store.head().await.hash, previous);

            // A fresh store over the same events re-derives the same head.
            let reopened = LedgerStore::open(storage, registry, SchemaRegistry::standard())
                .await
                .unwrap();
            assert_eq!(reopened.head().await, store.head().await);
            assert!(reopened.verify_chain(1, payloads.len() as u64).await.unwrap());
        });
    }

    /// Storage never accepts an event that skips over a missing predecessor.
    #[test]
    fn storage_refuses_a_gap(count in 3u64..20, drop_seed in any::<u64>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (custody, registry) = trusted_writer();
            let storage = Arc::new(MemoryEventStorage::new());
            let store = Arc::new(
                LedgerStore::open(storage.clone(), registry.clone(), SchemaRegistry::standard())
                    .await
                    .unwrap(),
            );
            let author = EventAuthor::new(store, custody, Arc::new(SystemClock));
            for n in 0..count {
                author
                    .append(EventPayload::StateRecorded {
                        subject: format!("seat-{n}"),
                        state_kind: "occupant".into(),
                        state_hash: ContentHash::hash(&n.to_le_bytes()),
                    })
                    .await
                    .unwrap();
            }

            let dropped = 2 + drop_seed % (count - 2);
            let gapped = MemoryEventStorage::new();
            let mut events = storage.range(1, count).await.unwrap();
            events.retain(|e| e.sequence < dropped);
            for event in &events {
                gapped.insert(event).await.unwrap();
            }
            // Storage refuses the out-of-order insert outright.
            let next = storage.get(dropped + 1).await.unwrap().unwrap();
            assert!(gapped.insert(&next).await.is_err());
        });
    }
}
