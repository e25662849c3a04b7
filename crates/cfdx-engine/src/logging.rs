//! Subscriber setup for embedding binaries and tests.

use cfdx_types::{CfdError, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. With `json` every event
/// is one JSON object per line, otherwise human-readable output.
///
/// # Errors
/// Returns `Configuration` for an unparsable filter or if a global
/// subscriber is already installed.
pub fn init(default_filter: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| CfdError::Configuration(format!("log filter {default_filter:?}: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| CfdError::Configuration(format!("tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        // Whichever call wins, the other must fail cleanly rather than panic.
        let first = init("info", false);
        let second = init("debug", true);
        assert!(first.is_err() || second.is_err());
    }
}
