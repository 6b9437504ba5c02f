//! Log dispatch construction.
//!
//! The library never installs a global subscriber. Callers build a
//! [`Dispatch`] here (or bring their own) and hand it to the orchestrator.

use tracing::Dispatch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Human-readable or JSON output on stderr at `level`, unless `RUST_LOG`
/// says otherwise.
pub fn opinionated(level: LevelFilter, json: bool) -> Dispatch {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("supastack={}", level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        Dispatch::new(
            registry.with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            ),
        )
    } else {
        Dispatch::new(
            registry.with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_level(true),
            ),
        )
    }
}

/// A dispatch that discards everything.
pub fn disabled() -> Dispatch {
    Dispatch::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opinionated_dispatch_accepts_events() {
        for json in [false, true] {
            let dispatch = opinionated(LevelFilter::DEBUG, json);
            tracing::dispatcher::with_default(&dispatch, || {
                tracing::info!(service = "demo-supastack-db", "Service is running");
            });
        }
    }

    #[test]
    fn test_disabled_dispatch_is_silent() {
        let dispatch = disabled();
        tracing::dispatcher::with_default(&dispatch, || {
            assert!(!tracing::enabled!(tracing::Level::ERROR));
        });
    }
}
