use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dohrelay::RelayDaemon;
use dohrelay::config::{ConfigWriteAction, RelaySettings, default_config_path};
use dohrelay::telemetry::init_tracing;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dohrelay", version, about = "DNS-over-HTTPS forwarding proxy with weighted upstream failover", long_about = None)]
struct Args {
    /// Path to dohrelay.toml (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the DoH listener address (host:port)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Print a configuration health report as JSON and exit
    #[arg(long, action = ArgAction::SetTrue)]
    check: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long, action = ArgAction::SetTrue)]
    write_config: bool,

    /// Replace an existing file when used with --write-config
    #[arg(long, action = ArgAction::SetTrue, requires = "write_config")]
    force: bool,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("dohrelay: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = RelaySettings::load_or_default(&config_path)?;
    if let Some(listen) = &args.listen {
        settings.server.listen = listen.clone();
    }

    init_tracing(args.verbose, &settings.logging)?;

    if args.write_config {
        let outcome = settings.write_config(&config_path, args.force)?;
        match outcome.action {
            ConfigWriteAction::Skipped => println!(
                "{} already exists; pass --force to replace it",
                outcome.path.display()
            ),
            ConfigWriteAction::Unchanged => {
                println!("{} is already up to date", outcome.path.display())
            }
            action => println!("{:?} {}", action, outcome.path.display()),
        }
        return Ok(ExitCode::SUCCESS);
    }

    if args.check {
        let report = settings.health_report();
        let rendered =
            serde_json::to_string_pretty(&report).context("Failed to render health report")?;
        println!("{rendered}");
        return Ok(if report.is_startable() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    for issue in settings.health_report().issues {
        warn!(%issue, "Configuration issue");
    }

    let daemon = RelayDaemon::new(settings)?;
    info!(config = %config_path.display(), providers = daemon.registry().len(), "Starting dohrelay");
    daemon.run().await?;
    Ok(ExitCode::SUCCESS)
}
