//! Writer liveness watchdog.
//!
//! Observes the canonical writer over several independent [`LivenessPath`]s
//! and tells death (every path silent) apart from partition (paths
//! disagree). Death leads to a witnessed failover ceremony; partition halts.

pub mod error;
pub mod path;
pub mod watchdog;

pub use error::{WatchdogError, WatchdogResult};
pub use path::{HeadProbe, HeartbeatBoard, HeartbeatPath, LivenessPath, PathObservation, ReplicaFollowPath};
pub use watchdog::{CeremonyFailoverInitiator, FailoverInitiator, Verdict, Watchdog, WatchdogConfig, WatchdogEvent};
