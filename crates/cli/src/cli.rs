use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "hyperforge", about = "Hyperforge microVM orchestration daemon", version)]
pub struct Cli {
    /// Path to the `HostConfig` TOML file.
    #[arg(long, env = "HYPERFORGE_CONFIG", default_value = "hyperforge.toml")]
    pub config: PathBuf,

    /// Default `tracing` level, overridden by `RUST_LOG` if set.
    #[arg(long, env = "HYPERFORGE_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Wire the runtime (corestore, replication, hypervisor, sandbox,
    /// registry) and drive it from an interactive command loop on
    /// stdin. No network server is started.
    Daemon,
    /// HAC config file operations, independent of a running daemon.
    Hac {
        #[command(subcommand)]
        action: HacCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum HacCommand {
    /// Parse and validate a `.hac` file against the host capacity in
    /// `--config`.
    Validate { path: PathBuf },
    /// Parse a `.hac` file and print its canonical, round-trippable
    /// formatting.
    Format { path: PathBuf },
    /// Print a minimal starting template for `provider`.
    Template { provider: String },
}
