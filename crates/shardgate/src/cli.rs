//! Command-line flags layered over the loaded settings.

use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use shardgate_settings::{GatewaySettings, load_settings};

/// Shard-aware WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "shardgate", about = "Shard-aware WebSocket gateway", version)]
pub struct Cli {
    /// JSON settings file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    pub port: Option<u16>,

    /// Log filter directive, e.g. `info` or `shardgate_server=debug`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Load defaults → file → env, then apply flags and re-validate.
    pub fn load_settings(&self) -> Result<GatewaySettings> {
        if let Some(path) = &self.config {
            ensure!(path.exists(), "settings file not found: {}", path.display());
        }
        let mut settings = load_settings(self.config.as_deref()).context("Failed to load settings")?;
        self.apply(&mut settings);
        settings.validate().context("Invalid settings after CLI overrides")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}
