use clap::Parser;
use tracing::{error, info};

use combcore::commit_engine::NullCommitEngine;
use combcore::config::{get_global_config, init_global_config, Cli};
use combcore::constants::CHECKPOINT_HEIGHT;
use combcore::core::Core;
use combcore::db::CommitDb;
use combcore::ingester::Ingester;
use combcore::metrics::init_metrics;
use combcore::signal::spawn_shutdown_handler;
use combcore::telemetry::{init_tracing, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_global_config(&cli)?;
    let settings = get_global_config();

    init_tracing(TelemetryConfig::default())?;
    init_metrics()?;

    let network = settings.network().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    let db_dir = network.db_dirname();
    let (db, is_new) = CommitDb::open(db_dir)?;
    info!(network = ?network, db_dir, is_new = is_new.0, "opened commit database");

    spawn_shutdown_handler(db.critical_lock());

    // libcomb is an external collaborator out of scope for this crate;
    // NullCommitEngine stands in so the pipeline runs end to end.
    let commit_engine = NullCommitEngine::new(CHECKPOINT_HEIGHT);
    let core = Core::new(db, commit_engine, network);

    let (mut ingester, corrupted) =
        Ingester::bootstrap(core, settings.rest_base_url(), settings.btc_data_dir()).await?;

    if !corrupted.is_empty() {
        info!(count = corrupted.len(), "repairing corrupted blocks from upstream");
        ingester.repair(corrupted).await?;
    }

    info!(height = ingester.current_height(), "starting ingestion");
    if let Err(e) = ingester.run().await {
        error!(error = %e, "ingester exited with error");
        return Err(Box::new(e));
    }

    Ok(())
}
