//! End-to-end test: state rebuilt from disk after a restart, and the
//! read-only inspection views over the same directory.

use conclave_halt::HaltState;
use conclave_kernel::inspect;
use conclave_tests::{fill, Harness};
use conclave_types::{CeremonyState, CeremonySubject, CeremonyType, SourceId};

#[tokio::test(flavor = "multi_thread")]
async fn pending_ceremony_and_halt_survive_restart() {
    let harness = Harness::durable().await;
    let (ceremony_id, head) = {
        let kernel = harness.open().await;
        fill(&kernel, 12).await;
        let ceremonies = kernel.ceremonies();
        let ceremony = ceremonies
            .request(
                CeremonyType::ParameterChange,
                CeremonySubject::Parameter {
                    name: "max_panel_size".into(),
                    value: "11".into(),
                },
                harness.approver(0),
            )
            .await
            .unwrap();
        ceremonies.approve(ceremony.id, harness.approve(0, &ceremony)).await.unwrap();
        kernel
            .halt()
            .trigger("replica-divergence", SourceId::new("replica-3"))
            .await
            .unwrap();
        (ceremony.id, kernel.head().await)
    };

    // Offline views, without the writer key.
    let status = inspect::status(&harness.config).await.unwrap();
    assert_eq!(status.head, head);
    assert!(matches!(&status.halt, HaltState::Halted(r) if r.reason == "replica-divergence"));
    assert_eq!(status.active_ceremonies.len(), 1);
    let summary = &status.active_ceremonies[0];
    assert_eq!(summary.id, ceremony_id);
    assert_eq!(summary.state, CeremonyState::Pending);
    assert_eq!((summary.approvals, summary.required_approvals), (1, 2));
    assert_eq!(status.writer_key.0, "writer-1");

    let report = inspect::verify(&harness.config, 1, None).await.unwrap();
    assert!(report.is_intact());
    assert_eq!(report.chain.checked, head.sequence);
    assert_eq!(report.audit_records, Some(2));

    // A restarted kernel picks up where the old one stopped.
    let kernel = harness.open().await;
    assert_eq!(kernel.head().await, head);
    assert!(kernel.halt().state().await.unwrap().is_halted());
    assert!(kernel.recovery().resumed.is_empty());
    let active = kernel.ceremonies().active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, ceremony_id);
    assert_eq!(active[0].approvers().count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn verify_reports_a_range() {
    let harness = Harness::durable().await;
    {
        let kernel = harness.open().await;
        fill(&kernel, 20).await;
    }
    let report = inspect::verify(&harness.config, 5, Some(9)).await.unwrap();
    assert!(report.is_intact());
    assert_eq!((report.chain.from, report.chain.to, report.chain.checked), (5, 9, 5));
    assert_eq!(report.head.sequence, 20);
    assert_eq!(report.audit_records, Some(0));
}
