//! Error types for background replacement operations

use std::time::Duration;
use thiserror::Error;

/// Result type alias for background replacement operations
pub type Result<T> = std::result::Result<T, BgReplaceError>;

/// Broad classification of a failure, used to pick the HTTP status and
/// decide how much detail reaches the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input supplied by the caller
    Validation,
    /// The external background-removal tool failed, hung or could not start
    UpstreamTool,
    /// Decoding or encoding an image failed
    ImageCodec,
    /// Anything else (filesystem, configuration, unexpected conditions)
    Internal,
}

/// Comprehensive error types for background replacement operations
#[derive(Error, Debug)]
pub enum BgReplaceError {
    /// Neither an uploaded file nor a URL was supplied
    #[error("No image provided")]
    NoImageProvided,

    /// Both an uploaded file and a URL were supplied
    #[error("Provide either a photo or a photo_url, not both")]
    AmbiguousInput,

    /// Malformed request body or form
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Uploaded payload is not an image
    #[error("Unsupported media type: {0}")]
    InvalidMediaType(String),

    /// Payload exceeds the configured ceiling
    #[error("Image is too large: {size} bytes (limit: {limit} bytes)")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// `photo_url` is not a well-formed absolute http(s) URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Remote resource does not advertise or contain an image
    #[error("URL does not point to an image: {0}")]
    RemoteNotAnImage(String),

    /// Remote fetch did not finish within the configured bound
    #[error("Timed out fetching remote image after {}s", .0.as_secs())]
    RemoteFetchTimeout(Duration),

    /// Remote server could not be reached or answered with an error status
    #[error("Failed to fetch remote image: {0}")]
    RemoteFetchFailed(String),

    /// Backdrop color is not a valid hex color
    #[error("Invalid color: {0}")]
    InvalidColor(String),

    /// External tool exceeded its wall-clock budget and was killed
    #[error("Background removal timed out after {}s", .0.as_secs())]
    BackgroundRemovalTimeout(Duration),

    /// External tool could not be launched or exited unsuccessfully
    #[error("Background removal failed: {0}")]
    BackgroundRemovalFailed(String),

    /// Intermediate image could not be decoded
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    /// Final composite could not be encoded
    #[error("Image encode error: {0}")]
    ImageEncode(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgReplaceError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new background removal failure
    pub fn removal_failed<S: Into<String>>(msg: S) -> Self {
        Self::BackgroundRemovalFailed(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoImageProvided
            | Self::AmbiguousInput
            | Self::InvalidRequest(_)
            | Self::InvalidMediaType(_)
            | Self::PayloadTooLarge { .. }
            | Self::InvalidUrl(_)
            | Self::RemoteNotAnImage(_)
            | Self::RemoteFetchTimeout(_)
            | Self::RemoteFetchFailed(_)
            | Self::InvalidColor(_) => ErrorKind::Validation,
            Self::BackgroundRemovalTimeout(_) | Self::BackgroundRemovalFailed(_) => {
                ErrorKind::UpstreamTool
            },
            Self::ImageDecode(_) | Self::ImageEncode(_) => ErrorKind::ImageCodec,
            Self::Io(_) | Self::InvalidConfig(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller is at fault
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Message safe to hand back to the caller.
    ///
    /// Validation errors are specific; tool, codec and internal failures are
    /// generic so diagnostics and paths stay in the server log.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::BackgroundRemovalTimeout(_) => "Background removal timed out".to_string(),
            Self::BackgroundRemovalFailed(_) => "Background removal failed".to_string(),
            Self::ImageDecode(_) | Self::ImageEncode(_) => "Image composition failed".to_string(),
            Self::Io(_) | Self::InvalidConfig(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            },
            _ => self.to_string(),
        }
    }
}
