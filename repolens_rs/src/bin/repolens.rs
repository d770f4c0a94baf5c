//! # repolens
//!
//! Command-line front end for the analysis pipeline. Every command acts on
//! behalf of the `--owner` login; output is pretty JSON on stdout, logs go
//! to stderr.
//!
//! ```bash
//! repolens --owner octocat repos
//! repolens --owner octocat save 1296269 1300192
//! repolens --owner octocat analyze 5b0c... --force
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use repolens::config::{RepolensConfig, load_config};
use repolens::{AnalysisError, AnalysisOrchestrator, TriggerOptions, TriggerOutcome};
use repolens_common::{OwnerId, RepositoryId, SelectionId};

#[derive(Parser, Debug)]
#[command(name = "repolens")]
#[command(about = "Analyse, score and classify a selection of repositories")]
#[command(version)]
struct Args {
    /// Config file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Login the command acts for
    #[arg(long, global = true, env = "REPOLENS_OWNER")]
    owner: Option<String>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the owner's repositories
    Repos,
    /// Save a selection of repository ids
    Save {
        #[arg(required = true)]
        ids: Vec<RepositoryId>,
    },
    /// List saved selections with their current state
    Selections,
    /// Delete a selection and everything recorded for it
    Delete { selection: String },
    /// Run an analysis and print the resulting status
    Analyze {
        selection: String,
        /// Run even without new activity
        #[arg(long)]
        force: bool,
    },
    /// Show the report, or the state while it is not ready
    Status { selection: String },
    /// Show every recorded status change
    History { selection: String },
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.parse().unwrap_or_default()),
        )
        .init();
}

fn resolve_config(args: &Args) -> Result<RepolensConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?
            .with_context(|| format!("config file not found: {}", path.display()))?,
        None => RepolensConfig::default(),
    }
    .apply_env();
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir.clone());
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = resolve_config(&args)?;
    let owner = OwnerId::new(
        args.owner
            .clone()
            .context("--owner (or REPOLENS_OWNER) is required")?,
    );
    let orchestrator = AnalysisOrchestrator::from_config(&config).await?;

    match args.command {
        Command::Repos => print_json(&orchestrator.repositories(&owner).await?)?,
        Command::Save { ids } => print_json(&orchestrator.save_selection(&owner, &ids).await?)?,
        Command::Selections => print_json(&orchestrator.selections(&owner).await?)?,
        Command::Delete { selection } => {
            orchestrator
                .delete_selection(&owner, &SelectionId::new(selection))
                .await?;
        }
        Command::Analyze { selection, force } => {
            let id = SelectionId::new(selection);
            match orchestrator
                .trigger(&owner, &id, TriggerOptions { force })
                .await?
            {
                TriggerOutcome::NoNewActivity => {
                    println!("no new activity since the last analysis; use --force to run anyway");
                }
                // the run is bound to this process, so stay until it settles
                TriggerOutcome::Started(handle) => {
                    info!(selection = %handle.selection_id(), "analysis started");
                    let run = handle.wait();
                    tokio::pin!(run);
                    tokio::select! {
                        done = &mut run => { done?; }
                        _ = tokio::signal::ctrl_c() => {
                            warn!(selection = %id, "interrupted, cancelling analysis");
                            orchestrator.shutdown();
                            // settles as `fail`
                            let _ = run.await;
                        }
                    }
                    print_json(&orchestrator.status(&owner, &id).await?)?;
                }
            }
        }
        Command::Status { selection } => print_json(
            &orchestrator
                .status(&owner, &SelectionId::new(selection))
                .await?,
        )?,
        Command::History { selection } => print_json(
            &orchestrator
                .history(&owner, &SelectionId::new(selection))
                .await?,
        )?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<AnalysisError>() {
                Some(analysis) => eprintln!("[repolens] {}", analysis.public_message()),
                None => eprintln!("[repolens] Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
