use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tally_config::Config;
use tally_system::Controller;

use crate::setup;

/// A metrics and trace aggregation daemon.
#[derive(Debug, Parser)]
#[command(name = "tally", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon (the default).
    Run,

    /// Validate the configuration file and exit.
    ConfigCheck,
}

/// Parses arguments and executes the requested command.
pub fn execute() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::ConfigCheck => {
            println!("config ok");
            Ok(())
        }
        Command::Run => run(config),
    }
}

fn run(mut config: Config) -> anyhow::Result<()> {
    if config.debug {
        config.logging.level = tally_log::Level::DEBUG;
    }

    tally_log::init(&config.logging);
    setup::dump_config(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());
        tally_server::run(config).await
    })?;

    Ok(())
}
