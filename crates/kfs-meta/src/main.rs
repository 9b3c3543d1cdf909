#![warn(missing_docs)]

//! KFS metaserver log daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use kfs_meta::{recover, CheckpointImage, CheckpointManager, LoggerConfig, OpLog, RecordImage};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "kfs-meta", about = "KFS metaserver operation log")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "KFS_META_CONFIG", default_value = "/etc/kfs/meta.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("KFS metaserver log starting...");

    let args = Args::parse();
    let config = if args.config.exists() {
        LoggerConfig::from_file(&args.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", args.config.display());
        LoggerConfig::default()
    };

    let point = recover(&config)?;
    let mut image = match &point.checkpoint {
        Some(path) => RecordImage::load(path)?.1,
        None => RecordImage::new(),
    };
    for req in &point.replay {
        image.apply(req)?;
    }

    let interval = Duration::from_secs(config.checkpoint_interval_secs.max(1));
    let log = Arc::new(OpLog::new(config));
    log.set_seqno(point.last_seqno);
    let worker = log.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut checkpointer = CheckpointManager::new(Arc::clone(&log), image);
    let checkpoint_handle = tokio::spawn(async move {
        if let Err(e) = checkpointer.run(interval, shutdown_rx).await {
            tracing::error!("Checkpointer error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    checkpoint_handle.await?;
    log.close();
    worker.await??;

    tracing::info!(committed = log.committed(), "KFS metaserver log stopped");
    Ok(())
}
