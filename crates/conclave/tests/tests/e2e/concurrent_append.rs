//! End-to-end test: two collaborators race to extend the same head.
//!
//! Exactly one draft lands; the other gets `ChainConflict` and the head
//! advances by one.

use conclave_kernel::{ConstitutionalKernel, KernelError};
use conclave_ledger::LedgerError;
use conclave_signing::SigningService;
use conclave_tests::{fill, vote_tally, Harness};
use conclave_types::{Clock, EventDraft, EventPayload, LedgerHead};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn signed_draft(kernel: &ConstitutionalKernel, head: &LedgerHead, payload: EventPayload) -> EventDraft {
    let draft = EventDraft::unsigned(head, payload, 1, kernel.clock().now());
    let (signature, key_id) = kernel.custody().sign(&draft.signable_bytes().unwrap()).await.unwrap();
    draft.signed(signature, key_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn exactly_one_of_two_racing_appends_wins() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 4).await;
    let h4 = kernel.head().await;
    assert_eq!(h4.sequence, 4);

    let first = signed_draft(&kernel, &h4, vote_tally("12", 100)).await;
    let second = signed_draft(&kernel, &h4, vote_tally("12", 200)).await;
    assert_eq!(first.sequence, 5);
    assert_eq!(first.previous_hash, h4.hash);

    let (a, b) = tokio::join!(kernel.submit(first), kernel.submit(second));
    let (winner, loser) = match (a, b) {
        (Ok(event), Err(e)) | (Err(e), Ok(event)) => (event, e),
        (a, b) => panic!("expected one success and one conflict, got {a:?} / {b:?}"),
    };
    assert!(matches!(
        loser,
        KernelError::Ledger(LedgerError::ChainConflict { head_sequence: 5, .. })
    ));
    assert_eq!(winner.sequence, 5);
    assert_eq!(winner.previous_hash, h4.hash);

    let head = kernel.head().await;
    assert_eq!(head.sequence, 5);
    assert_eq!(head.hash, winner.content_hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_is_not_retried_and_head_is_unchanged() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 2).await;
    let stale = kernel.head().await;
    fill(&kernel, 1).await;
    let head = kernel.head().await;

    let draft = signed_draft(&kernel, &stale, vote_tally("3", 9)).await;
    let err = kernel.submit(draft).await.unwrap_err();
    assert!(matches!(err, KernelError::Ledger(LedgerError::ChainConflict { .. })));
    assert_eq!(kernel.head().await, head);

    // The boundary reports it as an integrity conflict, not a pause.
    let notice = kernel.notice(&err);
    assert_eq!(notice.reason_code, "LEDGER_CHAIN_CONFLICT");
    assert!(!notice.paused_for_integrity);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_authors_serialize_without_gaps() {
    let mut harness = Harness::in_memory().await;
    // Each loser re-signs against the new head; allow enough rounds for all,
    // and keep the losses below the anomaly threshold.
    harness.config.ledger.max_resubmits = 8;
    harness.config.anomaly.threshold = 1_000;
    let kernel = harness.open().await;

    let appends = (0..8u64).map(|n| kernel.record(vote_tally("race", n)));
    let results = futures::future::join_all(appends).await;
    assert!(results.iter().all(Result::is_ok));

    let head = kernel.head().await;
    assert_eq!(head.sequence, 8);
    assert!(kernel.store().verify_chain(1, 8).await.unwrap());
}
