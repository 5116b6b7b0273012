//! Tracing subscriber setup (SPEC_FULL A.1), switched between human-readable
//! and JSON output by [`crate::config::TracingConfig`].

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::TracingConfig;

/// Installs the global subscriber. `RUST_LOG` overrides `config.service_name`'s
/// implied default of `info`; falls back to `info` if unset or invalid.
pub fn init(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if config.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
