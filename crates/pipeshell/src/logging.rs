//! Tracing setup
//!
//! Targets used across the crate:
//! - `pipeshell::fd` - descriptor plumbing
//! - `pipeshell::cmd` - pipeline node execution
//! - `pipeshell::ioreg` - reactor register/deregister
//! - `pipeshell::io` - reads and writes
//! - `pipeshell::signal` - child lifecycle and signals
//! - `pipeshell::job` - running pipeline state

use tracing_subscriber::EnvFilter;

use crate::config::ShellConfig;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "PIPESHELL_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install a fmt subscriber with the given filter directive.
/// Does nothing if a global subscriber is already set.
pub fn init(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Install a subscriber configured from `PIPESHELL_LOG`, defaulting to `warn`.
pub fn init_from_env() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// `PIPESHELL_LOG` wins over `engine.log_filter`.
pub fn init_from_config(config: &ShellConfig) {
    match (std::env::var(LOG_ENV).ok(), &config.engine.log_filter) {
        (None, Some(filter)) => init(filter),
        _ => init_from_env(),
    }
}
