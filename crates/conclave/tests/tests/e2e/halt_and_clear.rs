//! End-to-end test: a halt stops every mutation until a Tier 1 clear
//! ceremony completes.

use conclave_ceremony::CeremonyError;
use conclave_halt::{HaltError, HaltState};
use conclave_kernel::KernelError;
use conclave_tests::{fill, vote_tally, Harness};
use conclave_types::{
    CeremonyState, CeremonySubject, CeremonyType, EventPayload, HaltId, SourceId,
};

#[tokio::test(flavor = "multi_thread")]
async fn clear_needs_quorum_then_resumes_writes() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    fill(&kernel, 3).await;

    let halt = kernel
        .halt()
        .trigger("key-compromise-suspected", SourceId::new("operator"))
        .await
        .unwrap();
    assert!(!halt.already_halted);
    let halt_id = halt.record.halt_id;

    let err = kernel.record(vote_tally("1", 99)).await.unwrap_err();
    assert!(matches!(err, KernelError::Halt(HaltError::Halted { .. })));
    assert!(kernel.notice(&err).paused_for_integrity);

    // Only a clear may be opened while halted.
    assert!(matches!(
        kernel
            .ceremonies()
            .request(
                CeremonyType::ParameterChange,
                CeremonySubject::Parameter {
                    name: "quorum".into(),
                    value: "5".into()
                },
                harness.approver(0),
            )
            .await,
        Err(CeremonyError::Halt(HaltError::Halted { .. }))
    ));

    let ceremonies = kernel.ceremonies();
    let clear = ceremonies
        .request(CeremonyType::HaltClear, CeremonySubject::Halt { halt_id }, harness.approver(0))
        .await
        .unwrap();
    assert_eq!(clear.required_approvals, 2);

    let state = ceremonies.approve(clear.id, harness.approve(0, &clear)).await.unwrap();
    assert_eq!(state, CeremonyState::Pending);
    assert!(matches!(
        ceremonies.execute(clear.id).await,
        Err(CeremonyError::QuorumNotMet {
            approvals: 1,
            required_approvals: 2,
            ..
        })
    ));

    let state = ceremonies.approve(clear.id, harness.approve(1, &clear)).await.unwrap();
    assert_eq!(state, CeremonyState::Approved);
    let done = ceremonies.execute(clear.id).await.unwrap();
    assert_eq!(done.state, CeremonyState::Completed);

    assert_eq!(kernel.halt().state().await.unwrap(), HaltState::Running);
    let event = kernel.record(vote_tally("1", 99)).await.unwrap();

    // The clear is on the ledger, correlated to the halt it ended.
    let cleared = kernel
        .store()
        .read(1, event.sequence)
        .await
        .unwrap()
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::HaltCleared { halt_id, ceremony_id } => Some((halt_id, ceremony_id)),
            _ => None,
        })
        .unwrap();
    assert_eq!(cleared, (halt_id, clear.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_trigger_joins_the_active_halt() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;

    let first = kernel
        .halt()
        .trigger("replica-divergence", SourceId::new("replica-1"))
        .await
        .unwrap();
    let second = kernel
        .halt()
        .trigger("anomaly-threshold", SourceId::new("tracker"))
        .await
        .unwrap();
    assert!(second.already_halted);
    assert_eq!(second.record.halt_id, first.record.halt_id);

    // Concurrent checks all observe the halt.
    let checks = (0..8).map(|_| kernel.halt().check());
    for result in futures::future::join_all(checks).await {
        assert!(matches!(result, Err(HaltError::Halted { .. })));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_for_another_halt_fails_the_ceremony() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    kernel
        .halt()
        .trigger("operator-request", SourceId::new("operator"))
        .await
        .unwrap();

    let ceremonies = kernel.ceremonies();
    let stray = ceremonies
        .request(
            CeremonyType::HaltClear,
            CeremonySubject::Halt { halt_id: HaltId::new() },
            harness.approver(2),
        )
        .await
        .unwrap();
    for who in 0..2 {
        ceremonies.approve(stray.id, harness.approve(who, &stray)).await.unwrap();
    }
    let done = ceremonies.execute(stray.id).await.unwrap();
    assert_eq!(done.state, CeremonyState::Failed);
    assert!(kernel.halt().state().await.unwrap().is_halted());
}
