//! Conclave kernel.
//!
//! Wires the ledger, halt controller, ceremony engine, context builder and
//! watchdog over one data directory:
//! - [`KernelConfig`]: layered configuration (defaults, file, `CONCLAVE__*` env)
//! - [`ConstitutionalKernel`]: the facade collaborators submit through
//! - [`BoundaryHandler`]: the one place errors become operator notices
//! - [`init_tracing`]: subscriber setup for binaries

pub mod boundary;
pub mod config;
pub mod error;
pub mod inspect;
pub mod kernel;
pub mod keys;
pub mod telemetry;

pub use boundary::{BoundaryHandler, OperatorNotice};
pub use config::{
    AnomalySettings, ApproverEntry, KernelConfig, LedgerConfig, LoggingConfig, SigningConfig, StorageConfig,
    TrustAnchor,
};
pub use error::{KernelError, KernelResult};
pub use inspect::VerifyReport;
pub use kernel::{open_ledger, CeremonySummary, ConstitutionalKernel, KernelStatus, MaintenanceReport};
pub use keys::KeyDirectory;
pub use telemetry::init_tracing;
