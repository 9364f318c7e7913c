//! Input resolution service
//!
//! Turns an uploaded payload or a remote URL into a validated raw-input
//! artifact. Nothing is written to the uploads area until the bytes have
//! passed every check.

use crate::{
    config::ServerConfig,
    error::{BgReplaceError, Result},
    services::artifacts::ArtifactNamespace,
    types::{ArtifactStage, ImageSource, WorkingArtifact},
};
use futures_util::StreamExt;
use image::ImageFormat;
use reqwest::{header, Client, Response, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, instrument};

/// Content type sent by clients that do not know better; treated as undeclared
const GENERIC_BINARY: &str = "application/octet-stream";

/// Resolves request sources into raw-input artifacts
#[derive(Debug, Clone)]
pub struct InputResolver {
    client: Client,
    max_bytes: u64,
    fetch_timeout: Duration,
}

impl InputResolver {
    /// Create a resolver with its own HTTP client
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(max_bytes: u64, fetch_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .connect_timeout(fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("imgly-bgreplace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BgReplaceError::invalid_config(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            max_bytes,
            fetch_timeout,
        })
    }

    /// # Errors
    /// - Failed to create HTTP client
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(config.max_upload_bytes, config.fetch_timeout)
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Validate the source and persist it as the request's raw input
    ///
    /// # Errors
    /// - Any validation failure for the source kind
    /// - Write failures in the uploads area
    #[instrument(skip_all, fields(request_id = %namespace.request_id(), source = %source.kind()))]
    pub async fn resolve(
        &self,
        source: &ImageSource,
        namespace: &mut ArtifactNamespace,
    ) -> Result<WorkingArtifact> {
        let artifact = match source {
            ImageSource::Upload { bytes, media_type } => {
                let format = self.validate_upload(bytes, media_type.as_deref())?;
                namespace
                    .write(ArtifactStage::RawInput, extension_for(format), bytes)
                    .await?
            },
            ImageSource::RemoteUrl(url) => {
                let (bytes, format) = self.fetch_remote(url).await?;
                namespace
                    .write(ArtifactStage::RawInput, extension_for(format), &bytes)
                    .await?
            },
        };

        debug!(
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            "Raw input stored"
        );
        Ok(artifact)
    }

    /// Check size, declared type and content of an uploaded payload
    ///
    /// # Errors
    /// - `NoImageProvided` for an empty payload
    /// - `PayloadTooLarge` above the ceiling
    /// - `InvalidMediaType` when the declared type is not `image/*` or the bytes are not a known image format
    pub fn validate_upload(&self, bytes: &[u8], declared: Option<&str>) -> Result<ImageFormat> {
        if bytes.is_empty() {
            return Err(BgReplaceError::NoImageProvided);
        }

        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(BgReplaceError::PayloadTooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        if let Some(declared) = declared {
            let essence = media_type_essence(declared);
            if essence != GENERIC_BINARY && !is_image_media_type(&essence) {
                return Err(BgReplaceError::InvalidMediaType(essence));
            }
        }

        image::guess_format(bytes).map_err(|_| {
            BgReplaceError::InvalidMediaType("payload is not a recognized image".to_string())
        })
    }

    /// Parse and check a remote image URL without touching the network
    ///
    /// # Errors
    /// - `InvalidUrl` unless the string is an absolute http(s) URL with a host
    pub fn parse_url(raw: &str) -> Result<Url> {
        let trimmed = raw.trim();
        let url = Url::parse(trimmed).map_err(|e| {
            BgReplaceError::InvalidUrl(format!("'{}' ({})", trimmed, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(BgReplaceError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(BgReplaceError::InvalidUrl(format!("'{}' has no host", trimmed)));
        }

        Ok(url)
    }

    /// Probe and download a remote image within the fetch budget
    ///
    /// A HEAD request checks the advertised type first; servers that refuse
    /// HEAD are checked on the GET response instead. The body is streamed
    /// and abandoned as soon as it passes the size ceiling.
    ///
    /// # Errors
    /// - `InvalidUrl` before any network activity
    /// - `RemoteNotAnImage` for non-image content
    /// - `RemoteFetchTimeout` when the budget is exhausted
    /// - `RemoteFetchFailed` for connection errors or error statuses
    /// - `PayloadTooLarge` above the ceiling
    #[instrument(skip(self))]
    pub async fn fetch_remote(&self, raw_url: &str) -> Result<(Vec<u8>, ImageFormat)> {
        let url = Self::parse_url(raw_url)?;

        let bytes = tokio::time::timeout(self.fetch_timeout, self.download(url))
            .await
            .map_err(|_| BgReplaceError::RemoteFetchTimeout(self.fetch_timeout))??;

        let format = image::guess_format(&bytes).map_err(|_| {
            BgReplaceError::RemoteNotAnImage("content is not a recognized image".to_string())
        })?;
        Ok((bytes, format))
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>> {
        let head = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let probed = match head.status() {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                debug!(status = %head.status(), "HEAD not supported, checking GET response");
                false
            },
            status if status.is_success() => {
                ensure_image_response(&head)?;
                if let Some(length) = declared_length(&head) {
                    self.ensure_within_limit(length)?;
                }
                true
            },
            status => {
                return Err(BgReplaceError::RemoteFetchFailed(format!(
                    "server answered {}",
                    status
                )))
            },
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        if !response.status().is_success() {
            return Err(BgReplaceError::RemoteFetchFailed(format!(
                "server answered {}",
                response.status()
            )));
        }
        ensure_image_response(&response)?;
        if !probed {
            if let Some(length) = declared_length(&response) {
                self.ensure_within_limit(length)?;
            }
        }

        self.read_capped(response).await
    }

    async fn read_capped(&self, response: Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_transport_error(&e))?;
            self.ensure_within_limit((body.len() + chunk.len()) as u64)?;
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn ensure_within_limit(&self, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(BgReplaceError::PayloadTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> BgReplaceError {
        if error.is_timeout() {
            BgReplaceError::RemoteFetchTimeout(self.fetch_timeout)
        } else {
            BgReplaceError::RemoteFetchFailed(error.to_string())
        }
    }
}

fn ensure_image_response(response: &Response) -> Result<()> {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(media_type_essence)
        .ok_or_else(|| BgReplaceError::RemoteNotAnImage("missing Content-Type".to_string()))?;

    if is_image_media_type(&content_type) {
        Ok(())
    } else {
        Err(BgReplaceError::RemoteNotAnImage(content_type))
    }
}

fn declared_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// `"Image/PNG; charset=x"` -> `"image/png"`
fn media_type_essence(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_image_media_type(essence: &str) -> bool {
    essence
        .strip_prefix("image/")
        .is_some_and(|subtype| !subtype.is_empty())
}

fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}
