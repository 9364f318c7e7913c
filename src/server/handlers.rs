//! HTTP handlers
//!
//! `POST /upload` turns a multipart form into an [`ImageRequest`] and runs it
//! through the processor. `GET /health` is a liveness probe.

use super::{
    error::{ApiError, ApiResult},
    AppState,
};
use crate::{
    error::{BgReplaceError, Result},
    types::{ImageRequest, ImageSource},
};
use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        Multipart, State,
    },
    Json,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Form field carrying the uploaded image
pub const PHOTO_FIELD: &str = "photo";

/// Form field carrying a remote image URL
pub const PHOTO_URL_FIELD: &str = "photo_url";

/// Form field carrying the backdrop color
pub const COLOR_FIELD: &str = "color";

/// Ceiling for the text fields (`photo_url`, `color`)
const TEXT_FIELD_LIMIT: u64 = 8 * 1024;

/// Successful `/upload` response body
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// `data:image/png;base64,...`
    pub base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// POST /upload
pub async fn upload(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let mut multipart = multipart
        .map_err(|rejection| BgReplaceError::invalid_request(rejection.body_text()))?;

    let request = UploadForm::read(&mut multipart, state.config.max_upload_bytes)
        .await
        .and_then(UploadForm::into_request)
        .map_err(|e| {
            warn!(error = %e, "Rejected upload form");
            ApiError::from(e)
        })?;

    let result = state.processor.process(request).await?;
    Ok(Json(UploadResponse {
        base64: result.data_uri(),
        url: result.url,
    }))
}

/// Fields of the `/upload` form that matter
#[derive(Debug, Default)]
pub struct UploadForm {
    photo: Option<ImageSource>,
    photo_url: Option<String>,
    color: Option<String>,
}

impl UploadForm {
    /// Consume the multipart body
    ///
    /// The photo is read chunk by chunk and rejected as soon as it passes
    /// `max_photo_bytes`. Unknown fields are drained and ignored.
    ///
    /// # Errors
    /// - `PayloadTooLarge` for an oversized photo
    /// - `InvalidRequest` for a malformed body or repeated fields
    pub async fn read(multipart: &mut Multipart, max_photo_bytes: u64) -> Result<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                PHOTO_FIELD => {
                    if form.photo.is_some() {
                        return Err(BgReplaceError::invalid_request("more than one photo"));
                    }
                    let media_type = field.content_type().map(str::to_string);
                    let bytes = read_field(field, max_photo_bytes, true).await?;
                    debug!(size_bytes = bytes.len(), ?media_type, "Received photo");
                    // browsers send an empty part when no file was chosen
                    if !bytes.is_empty() {
                        form.photo = Some(ImageSource::Upload { bytes, media_type });
                    }
                },
                PHOTO_URL_FIELD => {
                    let value = read_text(field).await?;
                    if !value.trim().is_empty() {
                        form.photo_url = Some(value.trim().to_string());
                    }
                },
                COLOR_FIELD => {
                    form.color = Some(read_text(field).await?);
                },
                other => {
                    debug!(field = other, "Ignoring unknown form field");
                    read_field(field, TEXT_FIELD_LIMIT, false).await?;
                },
            }
        }

        Ok(form)
    }

    /// Build the pipeline request
    ///
    /// # Errors
    /// - `NoImageProvided` when neither source is present
    /// - `AmbiguousInput` when both are
    pub fn into_request(self) -> Result<ImageRequest> {
        let source = match (self.photo, self.photo_url) {
            (Some(upload), None) => upload,
            (None, Some(url)) => ImageSource::RemoteUrl(url),
            (None, None) => return Err(BgReplaceError::NoImageProvided),
            (Some(_), Some(_)) => return Err(BgReplaceError::AmbiguousInput),
        };
        Ok(ImageRequest::new(source, self.color))
    }
}

async fn read_field(mut field: Field<'_>, limit: u64, is_photo: bool) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        let size = (bytes.len() + chunk.len()) as u64;
        if size > limit {
            return Err(if is_photo {
                BgReplaceError::PayloadTooLarge { size, limit }
            } else {
                BgReplaceError::invalid_request(format!(
                    "form field '{}' is too long",
                    field.name().unwrap_or_default()
                ))
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text(field: Field<'_>) -> Result<String> {
    let name = field.name().unwrap_or_default().to_string();
    let bytes = read_field(field, TEXT_FIELD_LIMIT, false).await?;
    String::from_utf8(bytes)
        .map_err(|_| BgReplaceError::invalid_request(format!("form field '{}' is not UTF-8", name)))
}

fn multipart_error(error: MultipartError) -> BgReplaceError {
    BgReplaceError::invalid_request(error.body_text())
}
