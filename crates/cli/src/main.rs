mod cli;
mod daemon;
mod observability;

use clap::Parser;
use cli::{Cli, Command, HacCommand};
use hyperforge_config::HostConfig;

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    observability::init(&args.log_level, args.json_logs)?;

    match args.command {
        Command::Daemon => {
            let config = HostConfig::load(&args.config).unwrap_or_else(|err| {
                tracing::warn!(%err, "failed to load config, falling back to defaults");
                HostConfig::default()
            });
            let runtime = daemon::Daemon::wire(config)?;
            let stdin = std::io::stdin();
            runtime.run_repl(stdin.lock(), std::io::stdout())
        }
        Command::Hac { action } => run_hac(action, &args.config),
    }
}

fn run_hac(action: HacCommand, config_path: &std::path::Path) -> anyhow::Result<()> {
    match action {
        HacCommand::Validate { path } => {
            let text = std::fs::read_to_string(&path)?;
            let spec = hyperforge_hac::parse(&text).map_err(|e| anyhow::anyhow!(e))?;
            let host_capacity = HostConfig::load(config_path).unwrap_or_default().host_capacity.into();
            let result = hyperforge_hac::validate(&spec, host_capacity);
            if result.ok {
                println!("ok");
            } else {
                for reason in result.reasons {
                    println!("- {reason}");
                }
                anyhow::bail!("validation failed");
            }
            Ok(())
        }
        HacCommand::Format { path } => {
            let text = std::fs::read_to_string(&path)?;
            let spec = hyperforge_hac::parse(&text).map_err(|e| anyhow::anyhow!(e))?;
            print!("{}", hyperforge_hac::format(&spec));
            Ok(())
        }
        HacCommand::Template { provider } => {
            let provider: hyperforge_types::vm::Provider = provider.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            print!("{}", hyperforge_hac::format(&hyperforge_hac::default_template(provider)));
            Ok(())
        }
    }
}
