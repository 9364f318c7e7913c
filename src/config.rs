//! Configuration types for the background replacement service

use crate::error::{BgReplaceError, Result};
use crate::utils::ColorParser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default upload ceiling (5 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// Default wall-clock budget for the external tool
pub const DEFAULT_REMOVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default (and maximum) budget for fetching a remote image
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// What happens to the final composite once the response has been produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Delete the final composite right away; responses carry inline data only
    DeleteImmediately,
    /// Keep the final composite servable under `/processed/` for at least this long
    Retain(Duration),
}

impl RetentionPolicy {
    /// Build a policy from a number of seconds, where `0` means delete immediately
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::DeleteImmediately
        } else {
            Self::Retain(Duration::from_secs(secs))
        }
    }

    /// Whether final composites are served by URL
    #[must_use]
    pub fn serves_urls(&self) -> bool {
        matches!(self, Self::Retain(_))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Retain(Duration::from_secs(600))
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteImmediately => write!(f, "delete-immediately"),
            Self::Retain(window) => write!(f, "retain-{}s", window.as_secs()),
        }
    }
}

/// Configuration for the HTTP service and its pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Listening port
    pub port: u16,

    /// Origin permitted to make cross-origin requests
    pub allowed_origin: String,

    /// Largest accepted image, for uploads and remote fetches alike
    pub max_upload_bytes: u64,

    /// Hard wall-clock budget for the background-removal subprocess
    pub removal_timeout: Duration,

    /// Budget for probing and downloading a remote image
    pub fetch_timeout: Duration,

    /// Working area for raw inputs and background-removed intermediates
    pub uploads_dir: PathBuf,

    /// Directory holding final composites (served under `/processed/`)
    pub processed_dir: PathBuf,

    /// External tool executable
    pub remover_program: PathBuf,

    /// Arguments placed before `<input> <output>` when invoking the tool
    pub remover_args: Vec<String>,

    /// Final composite retention
    pub retention: RetentionPolicy,

    /// How often expired composites are swept
    pub sweep_interval: Duration,

    /// Backdrop used when the request carries no color
    pub default_color: String,

    /// Prefix for returned URLs (e.g. `https://api.example.com`); relative when unset
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            allowed_origin: "http://localhost:3000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            removal_timeout: DEFAULT_REMOVAL_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            uploads_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
            remover_program: PathBuf::from("rembg"),
            remover_args: vec!["i".to_string()],
            retention: RetentionPolicy::default(),
            sweep_interval: Duration::from_secs(60),
            default_color: "#ffffff".to_string(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Socket address string to bind
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    /// - Zero upload ceiling
    /// - Zero removal timeout
    /// - Fetch timeout outside 1-10 seconds
    /// - Identical uploads and processed directories
    /// - Empty tool program
    /// - Malformed default color
    pub fn validate(&self) -> Result<()> {
        if self.max_upload_bytes == 0 {
            return Err(BgReplaceError::config_value_error(
                "max_upload_bytes",
                0,
                "1 or more",
                Some(DEFAULT_MAX_UPLOAD_BYTES),
            ));
        }

        if self.removal_timeout.is_zero() {
            return Err(BgReplaceError::config_value_error(
                "removal_timeout_secs",
                0,
                "1 or more",
                Some(DEFAULT_REMOVAL_TIMEOUT.as_secs()),
            ));
        }

        if self.fetch_timeout.is_zero() || self.fetch_timeout > DEFAULT_FETCH_TIMEOUT {
            return Err(BgReplaceError::config_value_error(
                "fetch_timeout_secs",
                self.fetch_timeout.as_secs(),
                "1-10",
                Some(DEFAULT_FETCH_TIMEOUT.as_secs()),
            ));
        }

        if self.uploads_dir == self.processed_dir {
            return Err(BgReplaceError::invalid_config(
                "uploads_dir and processed_dir must differ; only final composites may be served",
            ));
        }

        if self.remover_program.as_os_str().is_empty() {
            return Err(BgReplaceError::invalid_config(
                "remover_program must not be empty",
            ));
        }

        if !ColorParser::is_valid_hex(self.default_color.trim()) {
            return Err(BgReplaceError::invalid_config(format!(
                "default_color '{}' is not a hex color",
                self.default_color
            )));
        }

        Ok(())
    }
}

/// Builder for `ServerConfig`
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    #[must_use]
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn allowed_origin<S: Into<String>>(mut self, origin: S) -> Self {
        self.config.allowed_origin = origin.into();
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    #[must_use]
    pub fn removal_timeout(mut self, timeout: Duration) -> Self {
        self.config.removal_timeout = timeout;
        self
    }

    #[must_use]
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn uploads_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.uploads_dir = dir.into();
        self
    }

    #[must_use]
    pub fn processed_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.processed_dir = dir.into();
        self
    }

    /// Set the tool executable and the arguments placed before `<input> <output>`
    #[must_use]
    pub fn remover_command<P, I, S>(mut self, program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.remover_program = program.into();
        self.config.remover_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn default_color<S: Into<String>>(mut self, color: S) -> Self {
        self.config.default_color = color.into();
        self
    }

    #[must_use]
    pub fn public_base_url(mut self, url: Option<String>) -> Self {
        self.config.public_base_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// Any failure reported by [`ServerConfig::validate`]
    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
