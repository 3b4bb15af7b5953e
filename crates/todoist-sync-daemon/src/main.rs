//! todoist-sync: keeps task completion in an Obsidian vault and Todoist in sync.
//!
//! `run` starts the periodic service; every other subcommand performs one
//! manual action and exits.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use todoist_sync_core::{SyncReport, SyncService};
use todoist_sync_daemon::{
    DaemonConfig, TodoistClient, TokioScheduler, TracingNotifier, build_coordinator,
};

#[derive(Parser, Debug)]
#[command(name = "todoist-sync")]
#[command(about = "Sync task completion between an Obsidian vault and Todoist")]
struct Args {
    /// Path to the vault directory (overrides OBSIDIAN_VAULT_PATH)
    #[arg(short, long, global = true)]
    vault: Option<PathBuf>,

    /// Seconds between sync cycles (overrides settings.json)
    #[arg(short, long, global = true)]
    interval: Option<u64>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync now and then every interval until Ctrl+C
    Run,
    /// Run one sync cycle
    Sync,
    /// Sync one task, bypassing the check interval
    SyncTask {
        /// Todoist task id
        task_id: String,
        /// Vault-relative path of the note holding the task
        path: String,
        /// Zero-based line of the task
        line: usize,
    },
    /// Sync every task in one note
    SyncFile {
        /// Vault-relative path of the note
        path: String,
    },
    /// Sync every tracked task in the vault
    SyncVault,
    /// Add linked tasks missing from the journal
    Heal,
    /// Back up and clear the sync journal
    ResetJournal {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Print sync statistics
    Stats,
}

fn log_report(report: &SyncReport) {
    info!(
        "{} ({} API calls, {}ms)",
        report.summary(),
        report.api_calls,
        report.duration_ms
    );
    for e in &report.errors {
        warn!("{}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,todoist_sync_core=debug,todoist_sync_daemon=debug"
    } else {
        "info,todoist_sync_core=info,todoist_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // A --vault flag takes the place of OBSIDIAN_VAULT_PATH
    let config = DaemonConfig::from_lookup(|key| match (key, &args.vault) {
        ("OBSIDIAN_VAULT_PATH", Some(vault)) => Some(vault.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })?;
    config.validate()?;

    let mut settings = config.load_settings()?;
    if let Some(interval) = args.interval {
        settings.sync_interval_secs = interval.max(1);
    }

    info!("Vault path: {:?}", config.vault_path);
    info!("Data directory: {:?}", config.data_dir);

    let remote = Arc::new(TodoistClient::new(config.api_token.clone())?);
    let coordinator = build_coordinator(&config, settings, remote, Arc::new(TracingNotifier));
    let mut service = SyncService::new(coordinator, Arc::new(TokioScheduler::new()));

    if !matches!(args.command, Command::Run) {
        service.coordinator().lock().await.initialize().await;
    }

    match args.command {
        Command::Run => {
            info!("Starting todoist-sync");
            if let Some((init, first)) = service.start().await {
                info!(
                    "Journal ready: {} paths corrected, {} tombstoned",
                    init.paths_corrected, init.tombstoned
                );
                log_report(&first);
            }
            info!("Running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received");
            service.stop().await;
        }
        Command::Sync => log_report(&service.sync_now().await),
        Command::SyncTask {
            task_id,
            path,
            line,
        } => {
            let report = service
                .sync_task(&task_id, &path, line)
                .await
                .with_context(|| format!("Failed to sync task {}", task_id))?;
            log_report(&report);
        }
        Command::SyncFile { path } => {
            let report = service
                .sync_file(&path)
                .await
                .with_context(|| format!("Failed to sync {}", path))?;
            log_report(&report);
        }
        Command::SyncVault => {
            let report = service.sync_vault().await.context("Failed to sync vault")?;
            log_report(&report);
        }
        Command::Heal => {
            let healed = service.heal_journal().await.context("Failed to heal journal")?;
            info!(
                "Healed journal: {} added, {} tombstoned, {} operations queued",
                healed.added,
                healed.tombstoned,
                healed.operations.len()
            );
            if let Some(backup) = healed.backup {
                info!("Backup written to {}", backup);
            }
        }
        Command::ResetJournal { yes } => {
            if !yes {
                bail!("Resetting drops every tracked task and tombstone; pass --yes to confirm");
            }
            match service.reset_journal().await.context("Failed to reset journal")? {
                Some(backup) => info!("Journal reset, backup written to {}", backup),
                None => warn!("Journal reset without a backup"),
            }
        }
        Command::Stats => {
            let stats = service.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
