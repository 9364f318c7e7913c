//! Core types for background replacement requests

use base64::{engine::general_purpose, Engine as _};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique token scoping every working file of one pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // hyphenated lowercase hex only, safe inside file names
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Where the image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Upload,
    RemoteUrl,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::RemoteUrl => write!(f, "remote_url"),
        }
    }
}

/// Image payload of a request
#[derive(Clone)]
pub enum ImageSource {
    /// Bytes received in the multipart body
    Upload {
        bytes: Vec<u8>,
        /// Content type declared by the client, if any
        media_type: Option<String>,
    },
    /// Absolute URL to fetch the image from
    RemoteUrl(String),
}

impl ImageSource {
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Upload { .. } => SourceKind::Upload,
            Self::RemoteUrl(_) => SourceKind::RemoteUrl,
        }
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload { bytes, media_type } => f
                .debug_struct("Upload")
                .field("len", &bytes.len())
                .field("media_type", media_type)
                .finish(),
            Self::RemoteUrl(url) => f.debug_tuple("RemoteUrl").field(url).finish(),
        }
    }
}

/// One background replacement request
#[derive(Debug, Clone)]
pub struct ImageRequest {
    id: RequestId,
    source: ImageSource,
    color: Option<String>,
}

impl ImageRequest {
    /// Create a request with a freshly generated id
    #[must_use]
    pub fn new(source: ImageSource, color: Option<String>) -> Self {
        Self::with_id(RequestId::new(), source, color)
    }

    /// Create a request with a caller-chosen id
    #[must_use]
    pub fn with_id(id: RequestId, source: ImageSource, color: Option<String>) -> Self {
        Self { id, source, color }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// Requested backdrop color as supplied, before validation
    #[must_use]
    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }
}

/// Pipeline stage that produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactStage {
    RawInput,
    BackgroundRemoved,
    FinalComposite,
}

impl ArtifactStage {
    /// File name suffix for this stage
    #[must_use]
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::RawInput => "raw",
            Self::BackgroundRemoved => "nobg",
            Self::FinalComposite => "final",
        }
    }

    /// Whether the artifact is deleted as soon as the final composite exists
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::FinalComposite)
    }
}

/// A file produced at one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingArtifact {
    pub request_id: RequestId,
    pub stage: ArtifactStage,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Outcome of a successful pipeline run
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub request_id: RequestId,
    /// PNG-encoded final composite
    pub image_bytes: Vec<u8>,
    /// Final composite dimensions
    pub dimensions: (u32, u32),
    /// Where the composite can be fetched, when retention is enabled
    pub url: Option<String>,
}

impl PipelineResult {
    /// Final composite as a `data:image/png;base64,...` URI
    #[must_use]
    pub fn data_uri(&self) -> String {
        format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&self.image_bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_path_safe() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);

        let text = a.to_string();
        assert_eq!(text.len(), 36);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_image_request_accessors() {
        let request = ImageRequest::new(
            ImageSource::RemoteUrl("https://example.com/cat.png".into()),
            Some("#00b894".into()),
        );
        assert_eq!(request.source().kind(), SourceKind::RemoteUrl);
        assert_eq!(request.color(), Some("#00b894"));

        let id = RequestId::new();
        let request = ImageRequest::with_id(
            id,
            ImageSource::Upload {
                bytes: vec![1, 2, 3],
                media_type: Some("image/png".into()),
            },
            None,
        );
        assert_eq!(request.id(), id);
        assert_eq!(request.source().kind(), SourceKind::Upload);
        assert!(request.color().is_none());
    }

    #[test]
    fn test_upload_debug_omits_bytes() {
        let source = ImageSource::Upload {
            bytes: vec![0xAB; 4096],
            media_type: None,
        };
        let rendered = format!("{:?}", source);
        assert!(rendered.contains("len: 4096"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn test_stage_suffixes() {
        assert_eq!(ArtifactStage::RawInput.suffix(), "raw");
        assert_eq!(ArtifactStage::BackgroundRemoved.suffix(), "nobg");
        assert_eq!(ArtifactStage::FinalComposite.suffix(), "final");
        assert!(ArtifactStage::RawInput.is_transient());
        assert!(ArtifactStage::BackgroundRemoved.is_transient());
        assert!(!ArtifactStage::FinalComposite.is_transient());
    }

    #[test]
    fn test_data_uri() {
        let result = PipelineResult {
            request_id: RequestId::new(),
            image_bytes: b"hello".to_vec(),
            dimensions: (1, 1),
            url: None,
        };
        assert_eq!(result.data_uri(), "data:image/png;base64,aGVsbG8=");
    }
}
