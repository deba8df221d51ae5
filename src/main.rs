//! # GNSS-R Logger
//!
//! Logs NMEA sentences from a GNSS receiver into compressed, daily-rotated
//! files and hands finished files to the upload worker.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use gnssr_logger::button::spawn_button_thread;
use gnssr_logger::config::{ClockSource, Config, LoggingConfig};
use gnssr_logger::gnss::{open_serial, run_reconnecting, FixState};
use gnssr_logger::pipeline::{
    self, spawn_rollover_ticker, AlwaysValid, FixSource, NoUpload, Pipeline, RotationTrigger,
    UploadHook,
};
use gnssr_logger::rotation::{Clock, FileNaming, RotationController, SystemClock};
use gnssr_logger::status::{self, DeviceStatus};
use gnssr_logger::storage::{paths, StreamWriter};
use gnssr_logger::upload::{DirectoryUploader, SyncPass, SyncScheduler};

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/gnssr.toml";

/// File name prefix of the daily diagnostic log
const LOG_FILE_PREFIX: &str = "gnssr-logger.log";

/// Main entry point for the GNSS-R logger
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load (or create) the configuration
///    - Set up logging
///    - Create directories and report unfinished files from the last run
///
/// 2. **Producers**
///    - NMEA reader task on the receiver's serial port, reopening it on loss
///    - Rollover ticker task
///    - Button thread (when configured)
///
/// 3. **Ingestion loop**
///    - Opens the first file, then writes records and rotates until Ctrl+C
///
/// 4. **Graceful Shutdown**
///    - Finalize the open file
///    - Log totals
///
/// # Examples
///
/// ```bash
/// gnssr-logger /etc/gnssr/gnssr.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load_or_create_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let _log_guard = init_logging(&config.logging)?;
    info!("GNSS-R Logger v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_path.display());

    // Storage housekeeping
    paths::ensure_dir(&config.storage.data_dir)?;
    paths::ensure_dir(&config.storage.archive_dir)?;
    if config.upload.enabled {
        paths::ensure_dir(&config.upload.outbox_dir)?;
    }
    let stale = paths::sweep_stale_temp_files(
        &config.storage.data_dir,
        config.storage.discard_stale_temp,
    )?;
    if stale > 0 {
        warn!("{} incomplete log files found in {}", stale, config.storage.data_dir.display());
    }

    let (status, mut status_rx) = status::channel();
    let trigger = RotationTrigger::new();
    let (records, record_rx) = pipeline::bounded(config.queue.capacity);
    let fix = Arc::new(FixState::with_rollover_trigger(trigger.clone()));

    // GNSS receiver, reopened whenever it goes away
    let port = config.gnss.port.clone();
    let baud_rate = config.gnss.baud_rate;
    let reader_task = tokio::spawn(run_reconnecting(
        move || open_serial(&port, baud_rate),
        config.gnss.sentences.clone(),
        Arc::clone(&fix),
        records,
        Duration::from_millis(config.gnss.reconnect_interval_ms),
    ));

    let ticker = spawn_rollover_ticker(
        trigger.clone(),
        Duration::from_secs(config.rotation.check_interval_s),
    );

    if !config.button.device_path.is_empty() {
        if let Err(e) = spawn_button_thread(
            PathBuf::from(&config.button.device_path),
            config.button.key_code,
            trigger.clone(),
        ) {
            warn!("Button disabled: {}", e);
        }
    }

    // Stand-in for the status LED
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let current = *status_rx.borrow();
            info!("Device status: {}", current);
        }
    });

    // Ingestion loop
    let writer = StreamWriter::new(config.storage.context_mode(), config.storage.frame_preferences())?;
    let clock: Box<dyn Clock> = match config.rotation.clock {
        ClockSource::Gnss => Box::new(Arc::clone(&fix)),
        ClockSource::System => Box::new(SystemClock),
    };
    let naming = FileNaming {
        dir: config.storage.data_dir.clone(),
        device_id: config.device.id.clone(),
        extension: config.storage.extension.clone(),
        timestamp_format: config.storage.timestamp_format.clone(),
    };
    let controller = RotationController::new(clock, naming);

    let fix_source: Box<dyn FixSource> = if config.gnss.require_fix {
        Box::new(Arc::clone(&fix))
    } else {
        Box::new(AlwaysValid)
    };

    let upload: Box<dyn UploadHook> = if config.upload.enabled {
        let pass = SyncPass {
            data_dir: config.storage.data_dir.clone(),
            archive_dir: config.storage.archive_dir.clone(),
            extension: config.storage.extension.clone(),
        };
        let uploader = Box::new(DirectoryUploader::new(config.upload.outbox_dir.clone()));
        let (scheduler, _worker) = SyncScheduler::spawn(pass, uploader, status.clone())?;
        Box::new(scheduler)
    } else {
        Box::new(NoUpload)
    };

    let mut pipeline = Pipeline::new(writer, controller, trigger.clone(), record_rx, fix_source, upload)
        .with_status(status.clone());
    if let Some(path) = config.storage.status_file() {
        pipeline = pipeline.with_status_file(path);
    }

    status.set(DeviceStatus::Searching);
    // Opens the first file
    trigger.raise();

    info!("Press Ctrl+C to exit");
    tokio::select! {
        _ = pipeline.run() => {
            error!("Record queue closed, stopping");
        }

        // Handle Ctrl+C for graceful shutdown
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    ticker.abort();
    reader_task.abort();
    if let Some(path) = pipeline.shutdown() {
        info!("Finalized {}", path.display());
    }

    let stats = pipeline.stats();
    info!(
        "Totals: {} written, {} discarded, {} dropped, {} write errors, {} rotations ({} failed)",
        stats.written,
        stats.discarded,
        stats.dropped,
        stats.write_errors,
        stats.rotations,
        stats.rotation_failures
    );

    Ok(())
}

/// Set up `tracing` to stderr, plus a daily file when `logging.dir` is set
///
/// The returned guard flushes the file writer when dropped and must live
/// until the end of `main`.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating log directory {}", config.dir))?;
    let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(Some(guard))
}
