//! Property tests: whatever operators do, every ceremony walks a legal path
//! through the transition table and ends in at most one terminal state.

use chrono::Duration;
use conclave_ceremony::AuditEntry;
use conclave_tests::Harness;
use conclave_types::{CeremonyState, CeremonySubject, CeremonyType, EventPayload};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Op {
    Approve(usize),
    Execute,
    Sweep,
    Advance(i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3).prop_map(Op::Approve),
        2 => Just(Op::Execute),
        1 => Just(Op::Sweep),
        // Hours; the Tier 1 timeout is six.
        1 => (1i64..8).prop_map(Op::Advance),
    ]
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn transitions_follow_the_table(ops in prop::collection::vec(arb_op(), 1..12)) {
        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let harness = Harness::in_memory().await;
            let kernel = harness.open().await;
            let ceremonies = kernel.ceremonies();
            let ceremony = ceremonies
                .request(
                    CeremonyType::ParameterChange,
                    CeremonySubject::Parameter {
                        name: "review_window".into(),
                        value: "48h".into(),
                    },
                    harness.approver(0),
                )
                .await
                .unwrap();

            for op in &ops {
                // Rejections are expected; only the recorded path matters.
                match op {
                    Op::Approve(who) => {
                        let _ = ceremonies.approve(ceremony.id, harness.approve(*who, &ceremony)).await;
                    }
                    Op::Execute => {
                        let _ = ceremonies.execute(ceremony.id).await;
                    }
                    Op::Sweep => {
                        let _ = ceremonies.sweep_expired().await;
                    }
                    Op::Advance(hours) => harness.clock.advance(Duration::hours(*hours)),
                }
            }

            let trail = ceremonies.audit_trail(ceremony.id).await.unwrap();
            let mut state = CeremonyState::Pending;
            let mut terminals = 0;
            for record in &trail {
                if let AuditEntry::Transition { from, to, .. } = &record.entry {
                    assert_eq!(*from, state);
                    assert!(from.can_transition_to(*to), "{from} -> {to}");
                    assert!(!from.is_terminal());
                    if to.is_terminal() {
                        terminals += 1;
                    }
                    state = *to;
                }
            }
            assert!(terminals <= 1);
            assert_eq!(ceremonies.status(ceremony.id).await.unwrap().state, state);

            // The ledger mirror saw the same path.
            let head = kernel.head().await.sequence;
            let mirrored: Vec<CeremonyState> = kernel
                .store()
                .read(1, head)
                .await
                .unwrap()
                .into_iter()
                .filter_map(|e| match e.payload {
                    EventPayload::CeremonyTransitioned { ceremony_id, to, .. } if ceremony_id == ceremony.id => Some(to),
                    _ => None,
                })
                .collect();
            assert_eq!(mirrored.first(), Some(&CeremonyState::Pending));
            assert_eq!(mirrored.last(), Some(&state));
        });
    }
}
