//! Property tests: a writer signature holds only while every signed field
//! is exactly as it was when signed.

use chrono::{Duration, TimeZone, Utc};
use conclave_signing::{crypto, KeyRegistry, SignatureVerifier};
use conclave_types::{ContentHash, Event, EventDraft, EventPayload, KeyId, LedgerHead};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Tamper {
    Timestamp(i64),
    PreviousHash(usize, u8),
    StateHash([u8; 8]),
    Subject(String),
    SignatureBit(usize, u8),
}

fn arb_tamper() -> impl Strategy<Value = Tamper> {
    prop_oneof![
        (1i64..1_000_000_000).prop_map(Tamper::Timestamp),
        (0usize..32, 1u8..=255).prop_map(|(i, x)| Tamper::PreviousHash(i, x)),
        any::<[u8; 8]>().prop_map(Tamper::StateHash),
        "[a-z]{1,12}".prop_map(Tamper::Subject),
        (0usize..64, 0u8..8).prop_map(|(i, bit)| Tamper::SignatureBit(i, bit)),
    ]
}

/// Apply `tamper`; false when it happens to leave the event unchanged.
fn apply(event: &mut Event, tamper: &Tamper) -> bool {
    match tamper {
        Tamper::Timestamp(ms) => event.timestamp += Duration::milliseconds(*ms),
        Tamper::PreviousHash(i, x) => event.previous_hash.0[*i] ^= x,
        Tamper::StateHash(seed) => {
            let EventPayload::StateRecorded { state_hash, .. } = &mut event.payload else {
                return false;
            };
            let altered = ContentHash::hash(seed);
            if *state_hash == altered {
                return false;
            }
            *state_hash = altered;
        }
        Tamper::Subject(new) => {
            let EventPayload::StateRecorded { subject, .. } = &mut event.payload else {
                return false;
            };
            if subject == new {
                return false;
            }
            *subject = new.clone();
        }
        Tamper::SignatureBit(i, bit) => event.signature.0[*i] ^= 1 << bit,
    }
    true
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn any_altered_field_fails_verification(
        seed in any::<[u8; 8]>(),
        subject in "[a-z]{1,12}",
        secs in 0i64..4_000_000_000,
        tamper in arb_tamper(),
    ) {
        let key = crypto::generate_signing_key();
        let registry = KeyRegistry::new(Duration::hours(1));
        registry
            .register_trust_anchor(KeyId::new("writer-1"), crypto::public_key_hex(&key.verifying_key()))
            .unwrap();

        let timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        let draft = EventDraft::unsigned(
            &LedgerHead::genesis(),
            EventPayload::StateRecorded {
                subject,
                state_kind: "vote_tally".into(),
                state_hash: ContentHash::hash(&seed),
            },
            1,
            timestamp,
        );
        let signature = crypto::sign_with(&key, &draft.signable_bytes().unwrap());
        let draft = draft.signed(signature, KeyId::new("writer-1"));
        let event = Event::from_draft(draft.clone(), draft.content_hash().unwrap());
        prop_assert!(registry.verify_event(&event).is_ok());

        let mut tampered = event.clone();
        prop_assume!(apply(&mut tampered, &tamper));
        prop_assert!(registry.verify_event(&tampered).is_err());
    }
}
