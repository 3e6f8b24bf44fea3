//! End-to-end test: a context bundle is a fixed point in time.
//!
//! Later appends never change what a stored bundle says, and the bundle
//! still verifies against the canonical chain until it is too stale.

use conclave_context::ContextError;
use conclave_kernel::KernelError;
use conclave_tests::{fill, vote_tally, Harness};
use conclave_types::{ContentHash, EventPayload, SessionId};

#[tokio::test(flavor = "multi_thread")]
async fn bundle_bytes_do_not_move_with_the_head() {
    let harness = Harness::durable().await;
    let kernel = harness.open().await;
    kernel
        .record(EventPayload::IdentityDeclared {
            subject: "assembly".into(),
            identity_hash: ContentHash::hash(b"assembly-charter"),
        })
        .await
        .unwrap();
    fill(&kernel, 99).await;
    assert_eq!(kernel.head().await.sequence, 100);

    let bundle = kernel.context().build(SessionId::new("session-c"), None).await.unwrap();
    assert_eq!(bundle.as_of_sequence, 100);
    assert!(bundle.identity_ref.is_some());
    let before = kernel.context().fetch_bytes(&bundle.bundle_id).await.unwrap();

    for n in 0..5 {
        kernel.record(vote_tally("0", 1_000 + n)).await.unwrap();
    }
    assert_eq!(kernel.head().await.sequence, 105);

    let after = kernel.context().fetch_bytes(&bundle.bundle_id).await.unwrap();
    assert_eq!(before, after);
    let fetched = kernel.context().fetch(&bundle.bundle_id).await.unwrap();
    assert_eq!(fetched, bundle);
    assert!(fetched.state("motion:0").unwrap().sequence <= 100);

    let verifier = kernel.bundle_verifier();
    verifier.verify(&fetched).await.unwrap();
    verifier.verify_derivation(&fetched).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bundle_survives_restart() {
    let harness = Harness::durable().await;
    let bundle = {
        let kernel = harness.open().await;
        fill(&kernel, 10).await;
        kernel.context().build(SessionId::new("session-r"), Some(7)).await.unwrap()
    };

    let kernel = harness.open().await;
    assert_eq!(kernel.context().fetch(&bundle.bundle_id).await.unwrap(), bundle);
    assert_eq!(bundle.as_of_sequence, 7);
    kernel.bundle_verifier().verify(&bundle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bundle_too_far_behind_head_is_stale() {
    let mut harness = Harness::in_memory().await;
    harness.config.context.max_staleness_events = 3;
    let kernel = harness.open().await;
    fill(&kernel, 2).await;
    let bundle = kernel.context().build(SessionId::new("session-s"), None).await.unwrap();

    fill(&kernel, 3).await;
    kernel.bundle_verifier().verify(&bundle).await.unwrap();
    fill(&kernel, 1).await;
    assert!(matches!(
        kernel.bundle_verifier().verify(&bundle).await,
        Err(ContextError::StaleContext { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn build_beyond_head_is_rejected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 4).await;
    let err = kernel
        .context()
        .build(SessionId::new("session-x"), Some(9))
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::SequenceNotFound { sequence: 9, .. }));

    let notice = kernel.notice(&KernelError::from(err));
    assert!(!notice.paused_for_integrity);
}
