//! Background Replacement Service launcher
//!
//! Parses flags and environment variables, installs the tracing subscriber
//! and runs the HTTP service until it is told to stop.

use super::config::CliConfigBuilder;
use crate::{
    server,
    tracing_config::{TracingConfig, TracingFormat},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

/// Background replacement HTTP service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "imgly-bgreplace")]
pub struct Cli {
    /// Interface to bind
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listening port
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Origin allowed to call the API from a browser ("*" for any)
    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    /// Largest accepted image in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 5 * 1024 * 1024)]
    pub max_upload_bytes: u64,

    /// Seconds the background removal tool may run before it is killed
    #[arg(long, env = "REMOVAL_TIMEOUT_SECS", default_value_t = 30)]
    pub removal_timeout_secs: u64,

    /// Seconds allowed for fetching a remote image (1-10)
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 10)]
    pub fetch_timeout_secs: u64,

    /// Working directory for raw inputs and intermediates
    #[arg(long, env = "UPLOADS_DIR", value_name = "PATH", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Directory for final composites, served under /processed/
    #[arg(long, env = "PROCESSED_DIR", value_name = "PATH", default_value = "processed")]
    pub processed_dir: PathBuf,

    /// Background removal executable
    #[arg(long, env = "REMBG_BIN", default_value = "rembg")]
    pub rembg_bin: PathBuf,

    /// Arguments passed before <input> <output> (space separated)
    #[arg(long, env = "REMBG_ARGS", value_delimiter = ' ', default_value = "i")]
    pub rembg_args: Vec<String>,

    /// Seconds a final composite stays downloadable (0 = delete right away, no URL)
    #[arg(long, env = "RESULT_RETENTION_SECS", default_value_t = 600)]
    pub retention_secs: u64,

    /// Seconds between sweeps of expired composites
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Backdrop color used when a request has none
    #[arg(long, env = "DEFAULT_COLOR", default_value = "#ffffff")]
    pub default_color: String,

    /// Absolute prefix for returned URLs (e.g. https://api.example.com)
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Tracing filter directives; overrides --verbose
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli).context("Failed to initialize tracing")?;

    let config = CliConfigBuilder::from_cli(&cli).context("Invalid configuration")?;
    debug!(?config, "Resolved configuration");

    server::serve(config)
        .await
        .context("Background replacement service failed")
}

/// Initialize tracing based on verbosity level and format
fn init_tracing(cli: &Cli) -> Result<()> {
    let mut tracing = TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(cli.log_format.into());
    if let Some(filter) = cli.log_filter.as_deref().filter(|f| !f.trim().is_empty()) {
        tracing = tracing.with_env_filter(filter);
    }

    tracing
        .init()
        .context("Failed to initialize tracing subscriber")
}
