//! Background replacement processor
//!
//! Sequences input resolution, background removal, compositing and
//! finalization for one request. Stages run strictly in order; the first
//! failure ends the request, reclaims everything it wrote and is returned
//! as a typed error. There are no retries.

use crate::{
    config::ServerConfig,
    error::{BgReplaceError, ErrorKind, Result},
    services::{
        ArtifactNamespace, ArtifactStore, BackgroundRemovalService, Compositor, InputResolver,
        SubprocessRemover,
    },
    tracing_config::spans,
    types::{ArtifactStage, ImageRequest, PipelineResult, RequestId},
    utils::{BackdropColor, ColorParser},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Validating,
    RemovingBackground,
    Compositing,
    Finalizing,
    Completed,
    Failed,
}

impl PipelineState {
    /// The only state reachable on success
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::Validating),
            Self::Validating => Some(Self::RemovingBackground),
            Self::RemovingBackground => Some(Self::Compositing),
            Self::Compositing => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `to` may follow `self`
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }

    /// Stable name used in logs and span fields
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::RemovingBackground => "removing_background",
            Self::Compositing => "compositing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Received => "Request received",
            Self::Validating => "Validating input",
            Self::RemovingBackground => "Removing background",
            Self::Compositing => "Compositing onto backdrop",
            Self::Finalizing => "Finalizing result",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// Records and enforces the state sequence of one request
#[derive(Debug)]
pub struct StateTracker {
    request_id: RequestId,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl StateTracker {
    #[must_use]
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: PipelineState::Received,
            history: vec![PipelineState::Received],
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Move to `to`
    ///
    /// # Errors
    /// - `Internal` for a transition outside the fixed sequence
    pub fn transition(&mut self, to: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(BgReplaceError::internal(format!(
                "illegal pipeline transition {:?} -> {:?}",
                self.state, to
            )));
        }
        debug!(
            request_id = %self.request_id,
            from = self.state.as_str(),
            to = to.as_str(),
            "{}",
            to.description()
        );
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

/// Runs the background replacement pipeline
pub struct BackgroundReplacementProcessor {
    resolver: InputResolver,
    remover: Arc<dyn BackgroundRemovalService>,
    store: Arc<ArtifactStore>,
    default_color: BackdropColor,
}

impl BackgroundReplacementProcessor {
    /// Create a processor that shells out to the configured tool
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Failed to create HTTP client
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Self::with_remover(config, Arc::new(SubprocessRemover::from_config(config)))
    }

    /// Create a processor with a custom background removal service
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Failed to create HTTP client
    pub fn with_remover(
        config: &ServerConfig,
        remover: Arc<dyn BackgroundRemovalService>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver: InputResolver::from_config(config)?,
            remover,
            store: Arc::new(ArtifactStore::from_config(config)),
            default_color: ColorParser::parse_hex(&config.default_color)?,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    #[must_use]
    pub fn remover_name(&self) -> &str {
        self.remover.name()
    }

    /// Run the whole pipeline for one request
    ///
    /// # Errors
    /// Whatever stage failed first; by then every file the request created
    /// has been removed.
    pub async fn process(&self, request: ImageRequest) -> Result<PipelineResult> {
        let span = spans::request(&request.id(), request.source().kind());
        self.process_inner(request).instrument(span).await
    }

    async fn process_inner(&self, request: ImageRequest) -> Result<PipelineResult> {
        let started = Instant::now();
        let mut tracker = StateTracker::new(request.id());
        let mut namespace = self.store.namespace(request.id());

        match self.run(&request, &mut namespace, &mut tracker).await {
            Ok(result) => {
                tracker.transition(PipelineState::Completed)?;
                info!(
                    width = result.dimensions.0,
                    height = result.dimensions.1,
                    served = result.url.is_some(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Background replaced"
                );
                Ok(result)
            },
            Err(e) => {
                let failed_in = tracker.state();
                // Failed is reachable from every non-terminal state
                let _ = tracker.transition(PipelineState::Failed);
                namespace.discard_all().await;
                match e.kind() {
                    ErrorKind::Validation => {
                        warn!(stage = failed_in.as_str(), error = %e, "Request rejected");
                    },
                    ErrorKind::UpstreamTool | ErrorKind::ImageCodec | ErrorKind::Internal => {
                        error!(stage = failed_in.as_str(), error = %e, "Pipeline failed");
                    },
                }
                Err(e)
            },
        }
    }

    async fn run(
        &self,
        request: &ImageRequest,
        namespace: &mut ArtifactNamespace,
        tracker: &mut StateTracker,
    ) -> Result<PipelineResult> {
        let id = request.id();

        tracker.transition(PipelineState::Validating)?;
        // color first: a bad color must not cost a fetch or a subprocess
        let color = self.backdrop_color(request.color())?;
        let raw = self
            .resolver
            .resolve(request.source(), namespace)
            .instrument(spans::stage(&id, PipelineState::Validating.as_str()))
            .await?;

        tracker.transition(PipelineState::RemovingBackground)?;
        let removed_path = namespace.reserve(ArtifactStage::BackgroundRemoved, "png")?;
        self.remover
            .remove(&raw.path, &removed_path)
            .instrument(spans::stage(&id, PipelineState::RemovingBackground.as_str()))
            .await?;
        let removed = namespace
            .register(ArtifactStage::BackgroundRemoved)
            .await
            .map_err(|_| {
                BgReplaceError::removal_failed(format!(
                    "{} reported success but wrote no output",
                    self.remover.name()
                ))
            })?;
        debug!(size_bytes = removed.size_bytes, "Background removed");

        tracker.transition(PipelineState::Compositing)?;
        let composite = Compositor::composite_file(&removed.path, color)
            .instrument(spans::stage(&id, PipelineState::Compositing.as_str()))
            .await?;

        tracker.transition(PipelineState::Finalizing)?;
        let final_artifact = namespace
            .write(ArtifactStage::FinalComposite, "png", &composite.png)
            .await?;
        namespace.release_transient().await;

        let file_name = final_artifact
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let url = self.store.url_for(&file_name);
        if url.is_some() {
            namespace.retain_final();
        } else {
            namespace.discard(ArtifactStage::FinalComposite).await;
        }

        Ok(PipelineResult {
            request_id: id,
            image_bytes: composite.png,
            dimensions: (composite.width, composite.height),
            url,
        })
    }

    fn backdrop_color(&self, requested: Option<&str>) -> Result<BackdropColor> {
        match requested.map(str::trim).filter(|c| !c.is_empty()) {
            Some(hex) => ColorParser::parse_hex(hex),
            None => Ok(self.default_color),
        }
    }
}
