//! Tracing/logging bootstrap for the smoke run.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,roomsync_engine=debug,roomsync_smoke=debug";

/// Initialize the global tracing subscriber with severity gating from the
/// environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `ROOMSYNC_LOG`
/// 3) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(env::var("ROOMSYNC_LOG").ok()))
}

/// Directives from `ROOMSYNC_LOG`, falling back to the default when it is
/// blank or does not parse.
fn filter_directives(roomsync_log: Option<String>) -> String {
    roomsync_log
        .filter(|value| !value.trim().is_empty())
        .filter(|value| EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
