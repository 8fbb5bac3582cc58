#![forbid(unsafe_code)]

//! `privprobe` CLI: provision, run, and tear down the privilege-isolation
//! scenario.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use privprobe_core::logging::{LogConfig, init_logging};
use privprobe_core::{Provisioner, ScenarioConfig, ScenarioRunner};

#[derive(Parser, Debug)]
#[command(
    name = "privprobe",
    version,
    about = "Privilege-isolation harness for online table-rewrite operations"
)]
struct Cli {
    /// Scenario configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "privprobe.toml",
        env = "PRIVPROBE_CONFIG"
    )]
    config: PathBuf,

    /// Debug-level logging (RUST_LOG still takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the scenario database, actor roles, extension, and seed data.
    Provision,
    /// Run the scenario and print the per-case verdict table.
    Run {
        /// Also write the machine-readable report to this path.
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Drop the scenario database and actor roles.
    Teardown,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (mut config, warnings) = ScenarioConfig::load(&cli.config)?;
    if cli.verbose {
        config.log.level = "debug".to_string();
    }

    let mut log_config = LogConfig::new(config.log.level.clone());
    if let Some(run_log) = &config.log.run_log {
        log_config = log_config.with_run_log(run_log);
    }
    let _guard = init_logging(&log_config)?;
    tracing::info!("configuration loaded from {}", cli.config.display());
    for warning in &warnings {
        tracing::warn!("config: {warning}");
    }

    match cli.command {
        Command::Provision => {
            Provisioner::new(config)?.provision().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Teardown => {
            Provisioner::new(config)?.teardown().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { json } => {
            let report = ScenarioRunner::new(config)?.run().await?;
            print!("{}", report.render());
            if let Some(path) = &json {
                report.write_json(path)?;
            }
            Ok(ExitCode::from(report.exit_code() as u8))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
