//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::config::{RetentionPolicy, ServerConfig};
use anyhow::{Context, Result};
use std::time::Duration;

/// Convert CLI arguments to `ServerConfig`
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build and validate a `ServerConfig` from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<ServerConfig> {
        let public_base_url = cli
            .public_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        let remover_args = cli.rembg_args.iter().filter(|arg| !arg.is_empty()).cloned();

        ServerConfig::builder()
            .host(cli.host.clone())
            .port(cli.port)
            .allowed_origin(cli.cors_origin.clone())
            .max_upload_bytes(cli.max_upload_bytes)
            .removal_timeout(Duration::from_secs(cli.removal_timeout_secs))
            .fetch_timeout(Duration::from_secs(cli.fetch_timeout_secs))
            .uploads_dir(cli.uploads_dir.clone())
            .processed_dir(cli.processed_dir.clone())
            .remover_command(cli.rembg_bin.clone(), remover_args)
            .retention(RetentionPolicy::from_secs(cli.retention_secs))
            .sweep_interval(Duration::from_secs(cli.sweep_interval_secs.max(1)))
            .default_color(cli.default_color.clone())
            .public_base_url(public_base_url)
            .build()
            .context("Invalid server configuration")
    }
}
