//! Adversarial test: the ceremony audit log is hash-chained; edits and
//! deletions on disk are caught before anything trusts it.

use std::path::PathBuf;

use conclave_ceremony::{CeremonyError, FileAuditStore};
use conclave_kernel::{inspect, ConstitutionalKernel, KernelError};
use conclave_tests::Harness;
use conclave_types::{CeremonySubject, CeremonyType};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run one parameter change to completion and return the audit log path.
async fn completed_ceremony(harness: &Harness) -> PathBuf {
    let kernel = harness.open().await;
    let ceremonies = kernel.ceremonies();
    let ceremony = ceremonies
        .request(
            CeremonyType::ParameterChange,
            CeremonySubject::Parameter {
                name: "max_panel_size".into(),
                value: "9".into(),
            },
            harness.approver(0),
        )
        .await
        .unwrap();
    for who in 0..2 {
        ceremonies.approve(ceremony.id, harness.approve(who, &ceremony)).await.unwrap();
    }
    ceremonies.execute(ceremony.id).await.unwrap();
    harness.data_dir().join(FileAuditStore::FILE_NAME)
}

async fn assert_rejected(harness: &Harness) {
    let err = inspect::verify(&harness.config, 1, None).await.unwrap_err();
    assert!(matches!(err, KernelError::Ceremony(CeremonyError::AuditCorrupted { .. })));

    let reopened = ConstitutionalKernel::open(
        harness.config.clone(),
        harness.custody.clone(),
        harness.failover.clone(),
        harness.clock.clone(),
    )
    .await;
    assert!(matches!(
        reopened,
        Err(KernelError::Ceremony(CeremonyError::AuditCorrupted { .. }))
    ));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn intact_log_verifies() {
    let harness = Harness::durable().await;
    completed_ceremony(&harness).await;
    let report = inspect::verify(&harness.config, 1, None).await.unwrap();
    // Requested, two approvals, then APPROVED, EXECUTING and COMPLETED.
    assert_eq!(report.audit_records, Some(6));
}

#[tokio::test(flavor = "multi_thread")]
async fn edited_record_detected() {
    let harness = Harness::durable().await;
    let path = completed_ceremony(&harness).await;
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("max_panel_size"));
    std::fs::write(&path, text.replacen("max_panel_size", "max_panel_sizes", 1)).unwrap();
    assert_rejected(&harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_record_detected() {
    let harness = Harness::durable().await;
    let path = completed_ceremony(&harness).await;
    let text = std::fs::read_to_string(&path).unwrap();
    let kept: Vec<&str> = text
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, line)| line)
        .collect();
    std::fs::write(&path, kept.join("\n") + "\n").unwrap();
    assert_rejected(&harness).await;
}
