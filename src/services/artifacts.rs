//! Artifact storage service
//!
//! Every request gets an [`ArtifactNamespace`] whose file names are derived
//! from its [`RequestId`], so concurrent requests never touch each other's
//! files. Raw inputs and background-removed intermediates live under the
//! uploads area; only final composites are written to the processed
//! directory, which is the one exposed over HTTP.

use crate::{
    config::{RetentionPolicy, ServerConfig},
    error::{BgReplaceError, Result},
    types::{ArtifactStage, RequestId, WorkingArtifact},
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owner of the working directories and the retention policy
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
    retention: RetentionPolicy,
    public_base_url: Option<String>,
}

impl ArtifactStore {
    #[must_use]
    pub fn new<U: Into<PathBuf>, P: Into<PathBuf>>(
        uploads_dir: U,
        processed_dir: P,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            processed_dir: processed_dir.into(),
            retention,
            public_base_url: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(&config.uploads_dir, &config.processed_dir, config.retention)
            .with_public_base_url(config.public_base_url.clone())
    }

    /// Prefix returned URLs with an absolute base
    #[must_use]
    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    #[must_use]
    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Create the working directories if missing
    ///
    /// # Errors
    /// - Directory creation failures
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.uploads_dir, &self.processed_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BgReplaceError::file_io_error("create directory", dir, &e))?;
        }
        Ok(())
    }

    /// Private artifact namespace for one request
    #[must_use]
    pub fn namespace(&self, request_id: RequestId) -> ArtifactNamespace {
        ArtifactNamespace {
            request_id,
            uploads_dir: self.uploads_dir.clone(),
            processed_dir: self.processed_dir.clone(),
            reserved: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// URL under which a retained composite is served, `None` when results are not served
    #[must_use]
    pub fn url_for(&self, file_name: &str) -> Option<String> {
        if !self.retention.serves_urls() {
            return None;
        }
        let base = self.public_base_url.as_deref().unwrap_or("");
        Some(format!("{}/processed/{}", base, file_name))
    }

    /// Delete final composites older than the retention window
    ///
    /// Returns the number of files removed. With
    /// [`RetentionPolicy::DeleteImmediately`] composites never outlive their
    /// request, so there is nothing to sweep and the directory is left alone.
    ///
    /// # Errors
    /// - Failed to read the processed directory
    pub async fn sweep_expired(&self) -> Result<usize> {
        match self.retention {
            RetentionPolicy::Retain(window) => {
                self.sweep_older_than(window, SystemTime::now()).await
            },
            RetentionPolicy::DeleteImmediately => Ok(0),
        }
    }

    async fn sweep_older_than(&self, window: Duration, now: SystemTime) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.processed_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(BgReplaceError::file_io_error(
                    "read processed directory",
                    &self.processed_dir,
                    &e,
                ))
            },
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            BgReplaceError::file_io_error("read processed directory", &self.processed_dir, &e)
        })? {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < window {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Swept expired composite");
                    removed += 1;
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to sweep composite"),
            }
        }

        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on a fixed interval
    ///
    /// Returns `None` without spawning anything when composites are not retained.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.retention.serves_urls() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_expired().await {
                    Ok(0) => {},
                    Ok(count) => info!(count, "Removed expired composites"),
                    Err(e) => warn!(error = %e, "Composite sweep failed"),
                }
            }
        }))
    }
}

/// Per-request set of working files
///
/// Paths are reserved before anything writes to them, so partial output from
/// a failed or killed stage is still known and reclaimed. Anything not
/// explicitly retained is deleted when the namespace is dropped, which covers
/// early returns and cancelled requests.
#[derive(Debug)]
pub struct ArtifactNamespace {
    request_id: RequestId,
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
    reserved: BTreeMap<ArtifactStage, PathBuf>,
    artifacts: BTreeMap<ArtifactStage, WorkingArtifact>,
}

impl ArtifactNamespace {
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Path a stage's artifact would occupy
    #[must_use]
    pub fn path_for(&self, stage: ArtifactStage, extension: &str) -> PathBuf {
        let dir = match stage {
            ArtifactStage::FinalComposite => &self.processed_dir,
            ArtifactStage::RawInput | ArtifactStage::BackgroundRemoved => &self.uploads_dir,
        };
        dir.join(format!(
            "{}_{}.{}",
            self.request_id,
            stage.suffix(),
            extension
        ))
    }

    /// Claim the path for a stage
    ///
    /// # Errors
    /// - The stage already has a path: artifacts are never rewritten in place
    pub fn reserve(&mut self, stage: ArtifactStage, extension: &str) -> Result<PathBuf> {
        if self.reserved.contains_key(&stage) {
            return Err(BgReplaceError::internal(format!(
                "artifact {:?} already exists for request {}",
                stage, self.request_id
            )));
        }
        let path = self.path_for(stage, extension);
        self.reserved.insert(stage, path.clone());
        Ok(path)
    }

    /// Record a file that something else (e.g. the external tool) wrote to a reserved path
    ///
    /// # Errors
    /// - The stage was never reserved
    /// - The file does not exist or cannot be inspected
    pub async fn register(&mut self, stage: ArtifactStage) -> Result<WorkingArtifact> {
        let path = self.reserved.get(&stage).cloned().ok_or_else(|| {
            BgReplaceError::internal(format!("artifact {:?} was not reserved", stage))
        })?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BgReplaceError::file_io_error("inspect artifact", &path, &e))?;

        let artifact = WorkingArtifact {
            request_id: self.request_id,
            stage,
            path,
            size_bytes: metadata.len(),
        };
        self.artifacts.insert(stage, artifact.clone());
        Ok(artifact)
    }

    /// Reserve a stage's path and write `bytes` to it
    ///
    /// # Errors
    /// - The stage already has an artifact
    /// - Write failures
    pub async fn write(
        &mut self,
        stage: ArtifactStage,
        extension: &str,
        bytes: &[u8],
    ) -> Result<WorkingArtifact> {
        let path = self.reserve(stage, extension)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BgReplaceError::file_io_error("write artifact", &path, &e))?;
        self.register(stage).await
    }

    /// Artifact recorded for a stage
    #[must_use]
    pub fn get(&self, stage: ArtifactStage) -> Option<&WorkingArtifact> {
        self.artifacts.get(&stage)
    }

    /// Delete a stage's file, if any
    pub async fn discard(&mut self, stage: ArtifactStage) {
        self.artifacts.remove(&stage);
        if let Some(path) = self.reserved.remove(&stage) {
            remove_quietly(&path).await;
        }
    }

    /// Delete raw input and background-removed intermediate
    pub async fn release_transient(&mut self) {
        self.discard(ArtifactStage::RawInput).await;
        self.discard(ArtifactStage::BackgroundRemoved).await;
    }

    /// Delete every file this namespace still owns
    pub async fn discard_all(&mut self) {
        let stages: Vec<ArtifactStage> = self.reserved.keys().copied().collect();
        for stage in stages {
            self.discard(stage).await;
        }
    }

    /// Hand the final composite over to the retention sweeper
    ///
    /// After this call the namespace no longer deletes the file.
    pub fn retain_final(&mut self) -> Option<WorkingArtifact> {
        self.reserved.remove(&ArtifactStage::FinalComposite);
        self.artifacts.remove(&ArtifactStage::FinalComposite)
    }

    /// Paths this namespace will delete on drop
    pub fn owned_paths(&self) -> impl Iterator<Item = &Path> {
        self.reserved.values().map(PathBuf::as_path)
    }
}

impl Drop for ArtifactNamespace {
    fn drop(&mut self) {
        for path in self.reserved.values() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Reclaimed abandoned artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to reclaim artifact"),
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}
