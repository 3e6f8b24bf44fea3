//! Adversarial test: a context bundle altered after signing, or anchored to
//! a different history, fails verification before use.

use conclave_context::ContextError;
use conclave_signing::{crypto, SigningService};
use conclave_tests::{fill, Harness};
use conclave_types::{ContentHash, EventPayload, KeyId, SessionId};

#[tokio::test(flavor = "multi_thread")]
async fn altered_state_reference_detected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 10).await;
    let bundle = kernel.context().build(SessionId::new("s-t1"), None).await.unwrap();

    let mut forged = bundle.clone();
    forged.state_refs[0].event_hash = ContentHash::hash(b"a tally that never happened");
    assert!(matches!(
        kernel.bundle_verifier().verify(&forged).await,
        Err(ContextError::BundleTampered { .. })
    ));

    // Re-hashing is not enough without the writer's key.
    forged.bundle_hash = forged.compute_hash().unwrap();
    assert!(matches!(
        kernel.bundle_verifier().verify(&forged).await,
        Err(ContextError::BundleTampered { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn bundle_signed_by_unknown_key_detected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 3).await;
    let mut bundle = kernel.context().build(SessionId::new("s-t2"), None).await.unwrap();

    let foreign = crypto::generate_signing_key();
    bundle.signature = crypto::sign_with(&foreign, bundle.bundle_hash.as_bytes());
    bundle.signing_key_id = KeyId::new("writer-9");
    assert!(matches!(
        kernel.bundle_verifier().verify(&bundle).await,
        Err(ContextError::BundleTampered { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn bundle_from_another_history_is_stale() {
    // Two ledgers with the same length but different content.
    let ours = Harness::in_memory().await;
    let theirs = Harness::in_memory().await;
    let kernel = ours.open().await;
    let other = theirs.open().await;
    fill(&kernel, 5).await;
    for n in 0..5u8 {
        other
            .record(EventPayload::IdentityDeclared {
                subject: format!("fork-{n}"),
                identity_hash: ContentHash::hash(&[n]),
            })
            .await
            .unwrap();
    }

    let foreign = other.context().build(SessionId::new("s-t3"), None).await.unwrap();
    // Signed by a key this kernel does not trust either.
    assert!(kernel.bundle_verifier().verify(&foreign).await.is_err());

    // A bundle claiming our sequence with their hash fails the anchor check
    // even when the rest is consistent.
    let mut ours_bundle = kernel.context().build(SessionId::new("s-t4"), None).await.unwrap();
    ours_bundle.as_of_hash = foreign.as_of_hash;
    ours_bundle.bundle_hash = ours_bundle.compute_hash().unwrap();
    let (signature, key_id) = kernel.custody().sign(ours_bundle.bundle_hash.as_bytes()).await.unwrap();
    ours_bundle.signature = signature;
    ours_bundle.signing_key_id = key_id;
    assert!(matches!(
        kernel.bundle_verifier().verify(&ours_bundle).await,
        Err(ContextError::StaleContext { .. })
    ));
    assert!(kernel.bundle_verifier().verify_derivation(&ours_bundle).await.is_err());
}
