//! End-to-end test: the watchdog declares a silent writer dead, halts and
//! opens a witnessed failover, and halts without failover when its liveness
//! paths disagree.

use std::sync::Arc;

use chrono::Duration;
use conclave_tests::Harness;
use conclave_types::{CeremonyState, CeremonySubject, CeremonyType, Clock, SharedClock};
use conclave_watchdog::{HeartbeatBoard, HeartbeatPath, LivenessPath, Verdict};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn heartbeat(name: &str, board: &Arc<HeartbeatBoard>, clock: SharedClock) -> Arc<dyn LivenessPath> {
    Arc::new(HeartbeatPath::new(name, board.clone(), Duration::seconds(5), clock))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn silent_writer_triggers_failover_ceremony() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let clock: SharedClock = harness.clock.clone();
    let board = kernel.heartbeat().clone();
    let paths = vec![
        heartbeat("direct", &board, clock.clone()),
        heartbeat("relay", &board, clock.clone()),
    ];
    let watchdog = kernel.watchdog(paths, "writer-standby", harness.approver(2)).unwrap();

    board.beat(clock.now());
    assert_eq!(watchdog.observe_round().await.unwrap(), Verdict::Healthy);

    harness.clock.advance(Duration::seconds(30));
    for round in 1..=3 {
        assert_eq!(
            watchdog.observe_round().await.unwrap(),
            Verdict::Unreachable { rounds: round }
        );
    }
    // Further dead rounds do not open a second ceremony.
    watchdog.observe_round().await.unwrap();
    let halted = kernel.halt().current_halt().await.unwrap();
    assert_eq!(halted.source.0, "watchdog");

    let active = kernel.ceremonies().active().await;
    assert_eq!(active.len(), 1);
    let failover = &active[0];
    assert_eq!(failover.ceremony_type, CeremonyType::WriterFailover);
    assert!(matches!(
        &failover.subject,
        CeremonySubject::WriterFailover { new_writer, .. } if new_writer == "writer-standby"
    ));

    let ceremonies = kernel.ceremonies();
    for who in 0..2 {
        ceremonies.approve(failover.id, harness.approve(who, failover)).await.unwrap();
    }
    let done = ceremonies.execute(failover.id).await.unwrap();
    assert_eq!(done.state, CeremonyState::Completed);
    assert_eq!(
        harness.failover.promotions(),
        vec![(kernel.config().watchdog.writer_id.clone(), "writer-standby".to_string())]
    );
    // Promotion does not clear the halt; that takes its own ceremony.
    assert!(kernel.halt().state().await.unwrap().is_halted());
}

#[tokio::test(flavor = "multi_thread")]
async fn disagreeing_paths_halt_the_system() {
    let harness = Harness::in_memory().await;
    let kernel = harness.open().await;
    let clock: SharedClock = harness.clock.clone();
    let reachable = kernel.heartbeat().clone();
    let cut_off = Arc::new(HeartbeatBoard::new());
    let watchdog = kernel
        .watchdog(
            vec![
                heartbeat("direct", &reachable, clock.clone()),
                heartbeat("relay", &cut_off, clock.clone()),
            ],
            "writer-standby",
            harness.approver(0),
        )
        .unwrap();

    reachable.beat(clock.now());
    let verdict = watchdog.observe_round().await.unwrap();
    assert!(matches!(verdict, Verdict::Partition { ref alive, .. } if alive == &vec!["direct".to_string()]));
    assert!(kernel.halt().state().await.unwrap().is_halted());
    assert!(kernel.ceremonies().active().await.is_empty());
}
