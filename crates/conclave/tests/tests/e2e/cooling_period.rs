//! End-to-end test: Tier 2 ceremonies wait out their cooling period.

use chrono::Duration;
use conclave_ceremony::CeremonyError;
use conclave_tests::Harness;
use conclave_types::{CeremonyState, CeremonySubject, CeremonyType, ContentHash, EventPayload, Tier};

fn amendment() -> CeremonySubject {
    CeremonySubject::Amendment {
        title: "Article IV: panel rotation".into(),
        text_hash: ContentHash::hash(b"article-iv-v2"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_waits_for_cooling_then_completes() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremonies = kernel.ceremonies();

    let ceremony = ceremonies
        .request(CeremonyType::ConstitutionalAmendment, amendment(), harness.approver(0))
        .await
        .unwrap();
    assert_eq!(ceremony.tier, Tier::Tier2);
    assert_eq!(ceremony.cooling_until - ceremony.requested_at, Duration::hours(24));

    for who in 0..3 {
        ceremonies.approve(ceremony.id, harness.approve(who, &ceremony)).await.unwrap();
    }
    assert!(matches!(
        ceremonies.execute(ceremony.id).await,
        Err(CeremonyError::CoolingPeriodActive { .. })
    ));

    harness.clock.advance(Duration::hours(23));
    assert!(matches!(
        ceremonies.execute(ceremony.id).await,
        Err(CeremonyError::CoolingPeriodActive { .. })
    ));
    assert_eq!(ceremonies.status(ceremony.id).await.unwrap().state, CeremonyState::Approved);

    harness.clock.advance(Duration::hours(1) + Duration::seconds(1));
    let done = ceremonies.execute(ceremony.id).await.unwrap();
    assert_eq!(done.state, CeremonyState::Completed);

    // APPROVED -> EXECUTING -> COMPLETED, every step mirrored to the ledger.
    let head = kernel.head().await.sequence;
    let events = kernel.store().read(1, head).await.unwrap();
    let mirrored: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CeremonyTransitioned { ceremony_id, to, .. } if *ceremony_id == ceremony.id => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        mirrored,
        vec![
            CeremonyState::Pending,
            CeremonyState::Approved,
            CeremonyState::Executing,
            CeremonyState::Completed
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(&e.payload, EventPayload::AmendmentRatified { ceremony_id, .. } if *ceremony_id == ceremony.id)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cooling_does_not_stop_the_timeout() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremonies = kernel.ceremonies();

    let ceremony = ceremonies
        .request(CeremonyType::SchemaAmendment, amendment(), harness.approver(1))
        .await
        .unwrap();
    for who in 0..3 {
        ceremonies.approve(ceremony.id, harness.approve(who, &ceremony)).await.unwrap();
    }
    let timeout = kernel.config().ceremony.tier2_timeout_secs;
    harness.clock.advance(Duration::seconds(timeout + 1));

    assert!(matches!(
        ceremonies.execute(ceremony.id).await,
        Err(CeremonyError::Expired(_))
    ));
    assert_eq!(ceremonies.status(ceremony.id).await.unwrap().state, CeremonyState::Expired);
}
