//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{KernelError, KernelResult};

/// Install the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> KernelResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| KernelError::Config(format!("invalid log filter {:?}: {e}", config.level)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| KernelError::Config(format!("tracing already initialised: {e}")))
}
