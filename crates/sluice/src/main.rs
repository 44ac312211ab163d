use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use sluice::config::{default_config_path, load_config, Config};
use sluice::db::default_database_path;
use sluice::error::{ConfigError, SluiceError};
use sluice::logging::init_logging;
use sluice::sanitize;
use sluice::store::{ObjectStore, S3ObjectStore};
use sluice::worker::{DirectoryScanner, Orchestrator, OrchestratorOptions};
use sluice::{FilePipeline, ProgressLedger, RecoveryCoordinator};

fn main() -> ExitCode {
    let Some(config_path) = resolve_config_path() else {
        eprintln!("No config file given: pass a path or set SLUICE_CONFIG");
        return ExitCode::FAILURE;
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(config.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %sanitize::redact_path(&config_path),
        "Starting sluice"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Stopped after a fatal error");
            ExitCode::FAILURE
        }
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("SLUICE_CONFIG").map(PathBuf::from))
        .or_else(default_config_path)
}

async fn run(config: Config) -> Result<(), SluiceError> {
    let db_path = config
        .database_path
        .clone()
        .or_else(default_database_path)
        .ok_or_else(|| ConfigError::Validation {
            message: "Cannot determine a database path; set database_path".to_string(),
        })?;
    let ledger = ProgressLedger::open(&db_path)?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(&config.s3).await?);
    let pipeline = FilePipeline::from_config(&config, ledger, store);

    // Nothing is accepted until local and remote state agree.
    RecoveryCoordinator::new(pipeline.ledger().clone(), pipeline.uploader().clone())
        .run()
        .await?;

    let scanner = DirectoryScanner::from_config(&config)?;
    let mut orchestrator = Orchestrator::new(
        Arc::new(pipeline),
        OrchestratorOptions::from_config(&config),
    );
    let sender = orchestrator.start()?;

    let (interrupt_tx, mut interrupt_rx) = tokio::sync::mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let watch_shutdown = Arc::new(AtomicBool::new(false));
    let detector = {
        let shutdown = Arc::clone(&watch_shutdown);
        let scan_on_start = config.watch.scan_on_start;
        std::thread::spawn(move || {
            if scan_on_start {
                info!("Performing initial scan...");
                match scanner.scan() {
                    Ok(found) => {
                        for event in found {
                            if let Err(e) = sender.blocking_send(event) {
                                warn!(error = %e, "Initial scan interrupted");
                                return;
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Initial scan failed"),
                }
            }
            if let Err(e) = scanner.watch(sender, shutdown) {
                error!(error = %e, "Watcher stopped");
            }
        })
    };

    let mut stop_signal = orchestrator.shutdown_signal();
    tokio::select! {
        _ = interrupt_rx.recv() => info!("Interrupt received, shutting down"),
        _ = stop_signal.wait_for(|stopping| *stopping) => warn!("Orchestrator requested shutdown"),
    }

    watch_shutdown.store(true, Ordering::Relaxed);
    let report = orchestrator.stop(config.shutdown_grace()).await;

    if tokio::task::spawn_blocking(move || detector.join())
        .await
        .map_or(true, |joined| joined.is_err())
    {
        warn!("Detector thread panicked");
    }

    info!(
        drained = report.drained,
        aborted = report.aborted.len(),
        dropped = report.dropped,
        "Shutdown complete"
    );

    match report.fatal {
        Some(fatal) => Err(fatal.into()),
        None => Ok(()),
    }
}
