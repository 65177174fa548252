//! Dispatch processor executable
//!
//! One-shot maintenance actions plus a continuous watch loop that closes
//! due lots on an interval.

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use dispatch_core::{
    BulkMessagingClient, DispatchConfig, LotOrchestrator, PhoneLookupClient, SqliteLotStore,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with INFO as default if RUST_LOG not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("dispatch-server")
        .version("1.0.0")
        .about("Bulk-messaging lot dispatcher")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/app/config/dispatch.json"),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .value_name("FILE")
                .help("Override the configured database path"),
        )
        .arg(
            Arg::new("process")
                .long("process")
                .help("Close and dispatch all due lots once")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("process-lot")
                .long("process-lot")
                .value_name("ID")
                .help("Force-close one open lot now, regardless of its window"),
        )
        .arg(
            Arg::new("retry-items")
                .long("retry-items")
                .help("Reset retryable failed items back to pending")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("retry-creation")
                .long("retry-creation")
                .help("Re-attempt remote creation for lots parked in failed_creation")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cancel-lot")
                .long("cancel-lot")
                .value_name("ID")
                .help("Cancel a lot, failing all of its pending items"),
        )
        .arg(
            Arg::new("reprocess-lot")
                .long("reprocess-lot")
                .value_name("ID")
                .help("Reopen a failed lot and dispatch it again"),
        )
        .arg(
            Arg::new("cleanup")
                .long("cleanup")
                .help("Purge finished lots past the retention window")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Run the processing loop continuously")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("interval-secs")
                .long("interval-secs")
                .value_name("SECS")
                .help("Watch loop interval")
                .default_value("60"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = DispatchConfig::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    if let Some(path) = matches.get_one::<String>("database") {
        config.database.path = path.clone();
    }
    log::info!("Loaded configuration from {}", config_path);

    let store = Arc::new(
        SqliteLotStore::open(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?,
    );
    log::info!("Using database at {}", config.database.path);

    let api = Arc::new(BulkMessagingClient::new(config.provider.clone()));
    let lookup = Arc::new(PhoneLookupClient::new(config.phone_lookup.clone()));
    let orchestrator = LotOrchestrator::new(store, api, lookup, config.orchestrator.clone());

    if matches.get_flag("process") {
        let report = orchestrator.process_due_lots().await?;
        log::info!(
            "Run complete: {} lots finished, {} failed, {} items sent",
            report.lots_finished,
            report.lots_failed,
            report.items_sent
        );
    } else if let Some(id) = matches.get_one::<String>("process-lot") {
        let id = parse_lot_id(id)?;
        let report = orchestrator.process_lot(id).await?;
        log::info!(
            "Lot {} processed: {} items sent, {} items failed",
            id,
            report.items_sent,
            report.items_failed
        );
    } else if matches.get_flag("retry-items") {
        let report = orchestrator.retry_failed_messages().await?;
        log::info!(
            "Retry complete: {} items reset across {} lots, {} skipped",
            report.items_reset,
            report.lots_touched,
            report.items_skipped
        );
    } else if matches.get_flag("retry-creation") {
        let report = orchestrator.retry_failed_lot_creation().await?;
        log::info!(
            "Creation retry complete: {} recovered, {} still failed",
            report.lots_recovered,
            report.lots_still_failed
        );
    } else if let Some(id) = matches.get_one::<String>("cancel-lot") {
        let id = parse_lot_id(id)?;
        let failed = orchestrator.cancel_lot(id).await?;
        log::info!("Lot {} cancelled, {} pending items failed", id, failed);
    } else if let Some(id) = matches.get_one::<String>("reprocess-lot") {
        let id = parse_lot_id(id)?;
        let report = orchestrator.reprocess_lot(id).await?;
        log::info!(
            "Lot {} reprocessed: {} items sent, {} items failed",
            id,
            report.items_sent,
            report.items_failed
        );
    } else if matches.get_flag("cleanup") {
        let report = orchestrator.cleanup_finished_lots().await?;
        log::info!(
            "Cleanup complete: {} lots and {} items removed",
            report.lots_deleted,
            report.items_deleted
        );
    } else if matches.get_flag("watch") {
        let interval: u64 = matches
            .get_one::<String>("interval-secs")
            .unwrap()
            .parse()
            .context("Invalid interval")?;
        watch(&orchestrator, interval).await;
    } else {
        log::error!("No action specified. Use --help for options.");
        std::process::exit(1);
    }

    Ok(())
}

fn parse_lot_id(raw: &str) -> anyhow::Result<i64> {
    match raw.parse() {
        Ok(id) => Ok(id),
        Err(_) => bail!("Invalid lot id: {}", raw),
    }
}

/// Continuous processing loop. Errors are logged and the loop keeps going;
/// a transient provider outage must not take the dispatcher down.
async fn watch(orchestrator: &LotOrchestrator, interval_secs: u64) {
    log::info!("Watching for due lots every {}s", interval_secs);

    loop {
        if let Err(e) = orchestrator.process_due_lots().await {
            log::error!("Processing run failed: {}", e);
        }
        if let Err(e) = orchestrator.retry_failed_messages().await {
            log::error!("Item retry run failed: {}", e);
        }
        if let Err(e) = orchestrator.retry_failed_lot_creation().await {
            log::error!("Creation retry run failed: {}", e);
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)).await;
    }
}
