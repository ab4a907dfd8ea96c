//! `tracing` initialization for the daemon binary (spec SPEC_FULL.md §0
//! "Logging"). Mirrors the shape of the reference workspace's
//! `Observability::init`, minus the log-file/telemetry plumbing this
//! workspace has no use for: one process-wide subscriber, an env-filter
//! layered over a CLI-supplied default level, human-readable by default
//! with an opt-in JSON formatter for machine consumption.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. Safe to call once per
/// process; a second call is a logic error in the caller, not something
/// this function guards against, matching how the reference CLI's
/// `Observability::init` is only ever called from `main`.
pub fn init(default_level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        subscriber.json().try_init().map_err(|e| anyhow::anyhow!(e))
    } else {
        subscriber.try_init().map_err(|e| anyhow::anyhow!(e))
    }
}
