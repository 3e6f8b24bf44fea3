use conclave_ceremony::CeremonyError;
use conclave_halt::HaltError;
use conclave_types::{Classified, ErrorClass};
use thiserror::Error;

pub type WatchdogResult<T> = Result<T, WatchdogError>;

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("writer unreachable on every path for {rounds} rounds")]
    WriterUnreachable { rounds: u32 },

    #[error("partition detected: alive via {alive:?}, failing via {failing:?}")]
    PartitionDetected { alive: Vec<String>, failing: Vec<String> },

    #[error("watchdog needs at least two independent paths, got {0}")]
    InsufficientPaths(usize),

    #[error("failover request failed: {0}")]
    Failover(String),

    #[error(transparent)]
    Halt(#[from] HaltError),

    #[error(transparent)]
    Ceremony(#[from] CeremonyError),
}

impl Classified for WatchdogError {
    fn class(&self) -> ErrorClass {
        match self {
            WatchdogError::WriterUnreachable { .. } | WatchdogError::PartitionDetected { .. } => ErrorClass::Liveness,
            WatchdogError::InsufficientPaths(_) | WatchdogError::Failover(_) => ErrorClass::Operational,
            WatchdogError::Halt(e) => e.class(),
            WatchdogError::Ceremony(e) => e.class(),
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            WatchdogError::WriterUnreachable { .. } => "WATCHDOG_WRITER_UNREACHABLE",
            WatchdogError::PartitionDetected { .. } => "WATCHDOG_PARTITION_DETECTED",
            WatchdogError::InsufficientPaths(_) => "WATCHDOG_INSUFFICIENT_PATHS",
            WatchdogError::Failover(_) => "WATCHDOG_FAILOVER",
            WatchdogError::Halt(e) => e.reason_code(),
            WatchdogError::Ceremony(e) => e.reason_code(),
        }
    }
}
