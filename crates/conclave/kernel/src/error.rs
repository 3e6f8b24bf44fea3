use conclave_ceremony::CeremonyError;
use conclave_context::ContextError;
use conclave_halt::HaltError;
use conclave_ledger::LedgerError;
use conclave_signing::SigningError;
use conclave_types::{Classified, ErrorClass, KeyId};
use conclave_watchdog::WatchdogError;
use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("key file for {key_id}: {reason}")]
    KeyFile { key_id: KeyId, reason: String },

    #[error("writer key {0} is neither a trust anchor nor activated on the ledger")]
    UntrustedWriterKey(KeyId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Halt(#[from] HaltError),

    #[error(transparent)]
    Ceremony(#[from] CeremonyError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl Classified for KernelError {
    fn class(&self) -> ErrorClass {
        match self {
            KernelError::Config(_) | KernelError::ConfigLoad(_) | KernelError::KeyFile { .. } | KernelError::Io(_) => {
                ErrorClass::Operational
            }
            KernelError::UntrustedWriterKey(_) => ErrorClass::Integrity,
            KernelError::Ledger(e) => e.class(),
            KernelError::Halt(e) => e.class(),
            KernelError::Ceremony(e) => e.class(),
            KernelError::Context(e) => e.class(),
            KernelError::Watchdog(e) => e.class(),
            KernelError::Signing(e) => e.class(),
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            KernelError::Config(_) => "KERNEL_CONFIG",
            KernelError::ConfigLoad(_) => "KERNEL_CONFIG_LOAD",
            KernelError::KeyFile { .. } => "KERNEL_KEY_FILE",
            KernelError::UntrustedWriterKey(_) => "KERNEL_UNTRUSTED_WRITER_KEY",
            KernelError::Io(_) => "KERNEL_IO",
            KernelError::Ledger(e) => e.reason_code(),
            KernelError::Halt(e) => e.reason_code(),
            KernelError::Ceremony(e) => e.reason_code(),
            KernelError::Context(e) => e.reason_code(),
            KernelError::Watchdog(e) => e.reason_code(),
            KernelError::Signing(e) => e.reason_code(),
        }
    }
}
