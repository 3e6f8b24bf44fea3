//! Adversarial test: approvals that do not verify never count toward quorum.

use conclave_ceremony::{Ceremony, CeremonyError};
use conclave_kernel::ConstitutionalKernel;
use conclave_tests::Harness;
use conclave_types::{ApproverId, CeremonyState, CeremonySubject, CeremonyType};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parameter(value: &str) -> CeremonySubject {
    CeremonySubject::Parameter {
        name: "session_quorum".into(),
        value: value.into(),
    }
}

async fn open_ceremony(kernel: &ConstitutionalKernel, harness: &Harness, value: &str) -> Ceremony {
    kernel
        .ceremonies()
        .request(CeremonyType::ParameterChange, parameter(value), harness.approver(0))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn approval_signed_with_unregistered_key_rejected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremony = open_ceremony(&kernel, &harness, "5").await;

    let err = kernel
        .ceremonies()
        .approve(ceremony.id, harness.forged_approval(1, &ceremony))
        .await
        .unwrap_err();
    assert!(matches!(err, CeremonyError::InvalidApproval { .. }));
    assert_eq!(
        kernel.ceremonies().status(ceremony.id).await.unwrap().approvers().count(),
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn approval_replayed_onto_another_ceremony_rejected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremonies = kernel.ceremonies();

    let first = open_ceremony(&kernel, &harness, "5").await;
    let approval = harness.approve(1, &first);
    ceremonies.approve(first.id, approval.clone()).await.unwrap();
    ceremonies.approve(first.id, harness.approve(2, &first)).await.unwrap();
    assert_eq!(ceremonies.execute(first.id).await.unwrap().state, CeremonyState::Completed);

    // Same approver, same parameter, different ceremony: the signature is
    // bound to the ceremony id.
    let second = open_ceremony(&kernel, &harness, "5").await;
    assert!(matches!(
        ceremonies.approve(second.id, approval).await,
        Err(CeremonyError::InvalidApproval { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn approval_for_a_different_subject_rejected() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremony = open_ceremony(&kernel, &harness, "5").await;

    let mut altered = ceremony.clone();
    altered.subject = parameter("50");
    assert!(matches!(
        kernel
            .ceremonies()
            .approve(ceremony.id, harness.approve(1, &altered))
            .await,
        Err(CeremonyError::InvalidApproval { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_and_unknown_approvers_do_not_reach_quorum() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let ceremonies = kernel.ceremonies();
    let ceremony = open_ceremony(&kernel, &harness, "7").await;

    ceremonies.approve(ceremony.id, harness.approve(1, &ceremony)).await.unwrap();
    assert!(matches!(
        ceremonies.approve(ceremony.id, harness.approve(1, &ceremony)).await,
        Err(CeremonyError::DuplicateApproval(_))
    ));

    let mut stranger = harness.forged_approval(2, &ceremony);
    stranger.approver = ApproverId::new("mallory");
    assert!(matches!(
        ceremonies.approve(ceremony.id, stranger).await,
        Err(CeremonyError::UnknownApprover(_))
    ));

    assert!(matches!(
        ceremonies.execute(ceremony.id).await,
        Err(CeremonyError::QuorumNotMet { approvals: 1, .. })
    ));
    assert_eq!(ceremonies.status(ceremony.id).await.unwrap().state, CeremonyState::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_requester_cannot_open_a_ceremony() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    assert!(matches!(
        kernel
            .ceremonies()
            .request(CeremonyType::ParameterChange, parameter("1"), ApproverId::new("mallory"))
            .await,
        Err(CeremonyError::UnknownApprover(_))
    ));
}
