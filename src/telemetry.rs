//! Tracing initialization for the daemon binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// Filter precedence: `RSVPD_LOG` env var, then the configured directive,
/// then `info`. Safe to call once per process; tests skip it entirely.
pub fn init(filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_env("RSVPD_LOG")
        .or_else(|_| match filter {
            Some(directive) => EnvFilter::try_new(directive),
            None => EnvFilter::try_new("info"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
