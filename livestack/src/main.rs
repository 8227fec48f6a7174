use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::setup_logging;
use livestack::broadcast::Broadcaster;
use livestack::capabilities::{Capabilities, FrameCodec};
use livestack::config::Config;
use livestack::fits::FitsCodec;
use livestack::ingest::Watcher;
use livestack::log_stream::BroadcastLogWriter;
use livestack::pipeline::{Pipeline, Stacker};
use livestack::server;
use livestack::store::CompositeStore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let broadcaster = Broadcaster::new();
    let log_writer = BroadcastLogWriter::new(broadcaster.clone(), config.stream_level()?);
    let _logger = setup_logging(&config.log_level, &config.log_dir, Some(Box::new(log_writer)))
        .context("Failed to start logging")?;

    let input_dir = config.input_dir()?.to_path_buf();
    log::info!(
        "livestack starting: input {}, storage {}, output {}",
        input_dir.display(),
        config.storage_dir.display(),
        config.output_dir.display()
    );

    let codec: Arc<dyn FrameCodec> = Arc::new(FitsCodec);
    let store = CompositeStore::open(&config.storage_dir, codec)
        .context("Failed to open composite store")?;
    log::info!("ledger holds {} processed sources", store.ledger().len());

    let pipeline = Pipeline::new(
        store,
        Capabilities::standard(&config.output_dir),
        broadcaster.clone(),
    );
    let stacker = Stacker::start(pipeline, config.stacker_options())
        .context("Failed to start worker thread")?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(listener, broadcaster.clone(), async move {
        let _ = shutdown_rx.await;
    }));

    let submitter = stacker.submitter();
    let (backlog, watcher) = Watcher::start(&input_dir, config.watcher_options(), move |path| {
        if let Err(err) = submitter.submit(path) {
            log::error!("{err}");
        }
    })
    .with_context(|| format!("Failed to watch {}", input_dir.display()))?;

    log::info!("replaying {} backlog files", backlog.len());
    for path in backlog {
        if let Err(err) = stacker.submit(path) {
            log::error!("{err}");
            break;
        }
    }

    wait_for_shutdown(&stacker).await;

    watcher.stop();
    let worker_result = tokio::task::spawn_blocking(move || stacker.stop())
        .await
        .context("Worker shutdown task failed")?;

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => log::error!("stream server failed: {err}"),
        Ok(Err(err)) => log::error!("stream server task failed: {err}"),
        Err(_) => log::warn!("stream server did not stop within {SERVER_SHUTDOWN_TIMEOUT:?}"),
    }

    worker_result.context("Worker stopped with a fatal error")?;
    log::info!("livestack stopped");
    Ok(())
}

/// Resolves on Ctrl-C or when the worker thread exits on its own.
async fn wait_for_shutdown(stacker: &Stacker) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(WORKER_CHECK_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                match result {
                    Ok(()) => log::info!("interrupted, shutting down"),
                    Err(err) => log::error!("failed to listen for Ctrl-C: {err}"),
                }
                return;
            }
            _ = ticker.tick() => {
                if stacker.is_finished() {
                    log::error!("worker exited, shutting down");
                    return;
                }
            }
        }
    }
}
