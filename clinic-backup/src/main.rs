//! Clinic Backup - Main entry point
//!
//! Runs one backup pipeline invocation and exits with its outcome code.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clinic_backup::{
    backend, dumper::CommandDumper, shutdown::ShutdownCoordinator, utils, Config, Pipeline,
    RunOutcome,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full backup pipeline (default)
    Run,
    /// List snapshots in the archive repository
    Snapshots,
    /// Verify stored archive data without taking a new backup
    Verify {
        /// Fraction of stored blocks to read back (overrides config)
        #[arg(long)]
        sample_fraction: Option<f64>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("clinic-backup: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("clinic-backup: {:#}", e);
        return ExitCode::from(1);
    }

    match execute(args.command.unwrap_or(Command::Run), config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<u8> {
    if let Command::Config = command {
        print!("{}", config.to_toml()?);
        return Ok(0);
    }

    let backend = backend::from_config(&config);
    let dumper = Arc::new(CommandDumper::new(&config.dump));
    let sample_fraction = config.sample_fraction;
    let pipeline = Pipeline::new(config, backend, dumper);

    match command {
        Command::Run => {
            tracing::info!(
                "Starting clinic-backup v{} (repository: {})",
                env!("CARGO_PKG_VERSION"),
                pipeline.backend().location()
            );

            // Create shutdown coordinator
            let shutdown = Arc::new(ShutdownCoordinator::new());
            let token = shutdown.token();
            let signals = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.wait_for_signal().await })
            };

            let outcome = pipeline.run(token).await;
            shutdown.trigger("run finished");
            let _ = signals.await;

            match outcome {
                Ok(RunOutcome::Completed(report)) => {
                    for error in &report.errors {
                        tracing::error!(run_id = %report.run_id, "{}", error);
                    }
                    Ok(report.exit_code())
                }
                Ok(RunOutcome::Skipped) => Ok(0),
                Err(e) => {
                    tracing::error!("{}", e);
                    Ok(e.exit_code())
                }
            }
        }
        Command::Snapshots => {
            let snapshots = pipeline.backend().snapshots().await?;
            for snapshot in &snapshots {
                let tags: Vec<&str> = snapshot.tags.iter().map(String::as_str).collect();
                println!(
                    "{}  {}  {:>12}  {}  {}",
                    snapshot.id.short(),
                    snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.total_bytes,
                    snapshot.hostname,
                    tags.join(",")
                );
            }
            println!("{} snapshot(s)", snapshots.len());
            Ok(0)
        }
        Command::Verify { sample_fraction: fraction } => {
            match pipeline.verify_only(fraction.unwrap_or(sample_fraction)).await {
                Ok(Some(report)) => {
                    println!(
                        "checked {} block(s), {} byte(s): ok",
                        report.checked_blocks, report.checked_bytes
                    );
                    Ok(0)
                }
                Ok(None) => Ok(0),
                Err(e) => {
                    tracing::error!("{}", e);
                    Ok(e.exit_code())
                }
            }
        }
        Command::Config => Ok(0),
    }
}
