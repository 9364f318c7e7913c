#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # IMG.LY Background Replacement Service
//!
//! Replaces the background of a photo with a solid color. A request carries
//! either an uploaded image or a URL to fetch one from, plus a hex color. The
//! pipeline runs an external segmentation tool (such as `rembg`) to cut out
//! the subject, composites the cut-out over the requested color and returns
//! a PNG both inline (as a base64 data URI) and, when retention is enabled,
//! as a downloadable URL.
//!
//! ## Pipeline
//!
//! ```text
//! Received -> Validating -> RemovingBackground -> Compositing -> Finalizing -> Completed
//!                 \________________\____________________\______________\____-> Failed
//! ```
//!
//! Every working file is named after the request's [`RequestId`], so
//! concurrent requests never share files, and every file a failed request
//! created is deleted before the error is returned.
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use imgly_bgreplace::{BackgroundReplacementProcessor, ImageRequest, ImageSource, ServerConfig};
//!
//! # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
//! let config = ServerConfig::builder()
//!     .remover_command("rembg", ["i"])
//!     .build()?;
//! let processor = BackgroundReplacementProcessor::new(&config)?;
//! processor.store().ensure_dirs().await?;
//!
//! let request = ImageRequest::new(
//!     ImageSource::Upload { bytes: upload, media_type: Some("image/jpeg".into()) },
//!     Some("#00b894".into()),
//! );
//! let result = processor.process(request).await?;
//! println!("{} x {}", result.dimensions.0, result.dimensions.1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Serving over HTTP
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! let config = imgly_bgreplace::ServerConfig::default();
//! imgly_bgreplace::server::serve(config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `cli` (default): the `imgly-bgreplace` launcher (flags, env vars, log setup)
//! - `webp-support` (default): accept WebP input
//! - `tracing-json`: JSON log output

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod processor;
pub mod server;
pub mod services;
pub mod tracing_config;
pub mod types;
pub mod utils;

// Public API exports
pub use config::{RetentionPolicy, ServerConfig, ServerConfigBuilder};
pub use error::{BgReplaceError, ErrorKind, Result};
pub use processor::{BackgroundReplacementProcessor, PipelineState, StateTracker};
pub use server::{create_router, AppState};
pub use services::{
    ArtifactNamespace, ArtifactStore, BackgroundRemovalService, CompositeImage, Compositor,
    InputResolver, SubprocessRemover,
};
pub use tracing_config::{spans, TracingConfig, TracingFormat};
pub use types::{
    ArtifactStage, ImageRequest, ImageSource, PipelineResult, RequestId, SourceKind,
    WorkingArtifact,
};
pub use utils::{BackdropColor, ColorParser};
