//! # shardgate
//!
//! Gateway binary: loads settings, wires the broker adapter, correlation
//! registry, shard admission and the HTTP/WebSocket server, then runs until
//! Ctrl-C.

#![deny(unsafe_code)]

mod app;
mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use shardgate_core::logging::{LogFormat, init_subscriber};

use crate::app::Gateway;
use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    let metrics = shardgate_server::metrics::install_recorder().context("Failed to install metrics recorder")?;
    let gateway = Gateway::start(settings, Some(metrics)).await?;

    tracing::info!("shardgate listening on http://{}", gateway.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = gateway.shutdown().await;
    tracing::info!(clean = report.is_clean(), "Shutdown complete");
    Ok(())
}
