//! Logging setup for binaries and integration harnesses.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

pub const LOG_ENV: &str = "OPSENSE_LOG";
const DEFAULT_FILTER: &str = "opsense_rag=info";

/// Install the global subscriber, writing to stderr.
///
/// Reads per-module levels from `OPSENSE_LOG`
/// (e.g. `OPSENSE_LOG=opsense_rag::pipeline=debug`), falling back to
/// `opsense_rag=info`. `json` switches to one JSON object per event. Later
/// calls are no-ops, as is calling this after another subscriber was set.
pub fn init_tracing(json: bool) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let result = if json {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .with(filter)
                .try_init()
        };
        if result.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing(false);
        init_tracing(true);
        tracing::info!("still logging");
    }
}
