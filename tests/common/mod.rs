//! Shared fixtures for the integration tests
//!
//! Stand-in background removers, generated images, a throwaway image server
//! and helpers for inspecting the working directories.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imgly_bgreplace::{
    BackgroundRemovalService, BackgroundReplacementProcessor, BgReplaceError, ServerConfig,
    ServerConfigBuilder,
};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Create a JPEG test photo
pub fn jpeg_photo(width: u32, height: u32) -> Vec<u8> {
    let mut image = image::RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let intensity = ((x + y) % 100) as u8;
        *pixel = image::Rgb([intensity, 128, 255 - intensity]);
    }
    encode(&DynamicImage::ImageRgb8(image), ImageFormat::Jpeg)
}

/// Create a PNG test photo
pub fn png_photo(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([90, 60, 30, 255]));
    encode(&DynamicImage::ImageRgba8(image), ImageFormat::Png)
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

/// Configuration rooted in a temporary directory
pub fn test_config(dir: &TempDir) -> ServerConfigBuilder {
    ServerConfig::builder()
        .uploads_dir(dir.path().join("uploads"))
        .processed_dir(dir.path().join("processed"))
        .fetch_timeout(Duration::from_secs(2))
}

/// Processor with working directories created
pub async fn processor_with(
    config: &ServerConfig,
    remover: Arc<dyn BackgroundRemovalService>,
) -> BackgroundReplacementProcessor {
    let processor = BackgroundReplacementProcessor::with_remover(config, remover).unwrap();
    processor.store().ensure_dirs().await.unwrap();
    processor
}

/// Regular files currently in `dir` (empty when it does not exist)
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Decode a `data:image/png;base64,...` URI
pub fn decode_data_uri(uri: &str) -> RgbaImage {
    use base64::{engine::general_purpose, Engine as _};

    let payload = uri
        .strip_prefix("data:image/png;base64,")
        .expect("PNG data URI");
    let bytes = general_purpose::STANDARD.decode(payload).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    image::load_from_memory(&bytes).unwrap().to_rgba8()
}

/// Mock remover: clears the left half of the image, keeps the right half opaque
#[derive(Debug, Default)]
pub struct CutoutRemover {
    calls: AtomicUsize,
}

impl CutoutRemover {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemovalService for CutoutRemover {
    fn name(&self) -> &str {
        "cutout-mock"
    }

    async fn remove(&self, input: &Path, output: &Path) -> imgly_bgreplace::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = tokio::fs::read(input).await?;
        let mut image = image::load_from_memory(&bytes)
            .map_err(|e| BgReplaceError::removal_failed(e.to_string()))?
            .to_rgba8();
        let half = image.width() / 2;
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            pixel.0[3] = if x < half { 0 } else { 255 };
        }
        let png = encode(&DynamicImage::ImageRgba8(image), ImageFormat::Png);
        tokio::fs::write(output, png).await?;
        Ok(())
    }
}

/// Mock remover that never finishes on its own
#[derive(Debug, Default)]
pub struct StallingRemover {
    started: AtomicUsize,
}

impl StallingRemover {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemovalService for StallingRemover {
    fn name(&self) -> &str {
        "stalling-mock"
    }

    async fn remove(&self, _input: &Path, output: &Path) -> imgly_bgreplace::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        // leave a partial file behind, like a tool killed mid-write
        tokio::fs::write(output, b"\x89PNG partial").await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

/// Mock remover with a canned outcome
#[derive(Debug)]
pub enum ScriptedRemover {
    /// Reports failure
    Fail,
    /// Reports success without writing anything
    NoOutput,
    /// Writes bytes that are not an image
    Garbage,
    /// Leaves partial output behind, then fails after a short delay
    PartialThenFail,
}

#[async_trait]
impl BackgroundRemovalService for ScriptedRemover {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn remove(&self, _input: &Path, output: &Path) -> imgly_bgreplace::Result<()> {
        match self {
            Self::Fail => Err(BgReplaceError::removal_failed(
                "onnxruntime: model /srv/models/u2net.onnx missing",
            )),
            Self::NoOutput => Ok(()),
            Self::Garbage => {
                tokio::fs::write(output, b"definitely not a png").await?;
                Ok(())
            },
            Self::PartialThenFail => {
                tokio::fs::write(output, b"\x89PNG partial").await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(BgReplaceError::removal_failed("worker crashed mid-write"))
            },
        }
    }
}

/// Write an executable-by-sh script standing in for the removal tool
pub fn tool_script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-rembg.sh");
    std::fs::write(&path, body).unwrap();
    path
}

/// Whether the process whose pid is stored in `pid_file` is still alive
///
/// Polls for up to two seconds; zombies awaiting their reaper count as gone.
#[cfg(target_os = "linux")]
pub async fn process_alive(pid_file: &Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
    for _ in 0..40 {
        let alive = std::fs::read_to_string(&stat)
            .ok()
            .and_then(|line| {
                let state = line.get(line.rfind(')')? + 1..)?.trim_start().chars().next()?;
                Some(!matches!(state, 'Z' | 'X'))
            })
            .unwrap_or(false);
        if !alive {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

/// Local HTTP server hosting remote-image fixtures
///
/// - `/photo.jpg`: a 120x80 JPEG
/// - `/no-head.jpg`: the same JPEG, but HEAD answers 405
/// - `/page.html`: an HTML page
/// - `/fake.png`: text served as `image/png`
/// - `/big.jpg`: 256 KiB served as `image/jpeg`
/// - `/slow.jpg`: answers after 5 seconds
/// - `/missing.jpg`: 404
pub async fn spawn_image_server() -> SocketAddr {
    // keep any proxy configured in the environment away from loopback fixtures
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    std::env::set_var("no_proxy", "127.0.0.1,localhost");

    let photo = jpeg_photo(120, 80);
    let photo_for_fallback = photo.clone();

    let app = Router::new()
        .route(
            "/photo.jpg",
            get(move || {
                let photo = photo.clone();
                async move { ([(header::CONTENT_TYPE, "image/jpeg")], photo) }
            }),
        )
        .route(
            "/no-head.jpg",
            get(move || {
                let photo = photo_for_fallback.clone();
                async move { ([(header::CONTENT_TYPE, "image/jpeg")], photo) }
            })
            .head(|| async { StatusCode::METHOD_NOT_ALLOWED }),
        )
        .route(
            "/page.html",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    "<html><body>not an image</body></html>",
                )
            }),
        )
        .route(
            "/fake.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], "plain text, honest") }),
        )
        .route(
            "/big.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], vec![0xFFu8; 256 * 1024]) }),
        )
        .route(
            "/slow.jpg",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ([(header::CONTENT_TYPE, "image/jpeg")], jpeg_photo(8, 8))
            }),
        )
        .route(
            "/missing.jpg",
            get(|| async { StatusCode::NOT_FOUND.into_response() }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Build a `multipart/form-data` body
#[derive(Debug, Default)]
pub struct MultipartBuilder {
    parts: Vec<u8>,
}

impl MultipartBuilder {
    pub const BOUNDARY: &'static str = "imgly-test-boundary-7MA4YWxkTrZu0gW";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.parts.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                Self::BOUNDARY,
                name,
                value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.parts.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                Self::BOUNDARY,
                name,
                filename,
                content_type
            )
            .as_bytes(),
        );
        self.parts.extend_from_slice(bytes);
        self.parts.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={}", Self::BOUNDARY)
    }

    pub fn build(mut self) -> Vec<u8> {
        self.parts
            .extend_from_slice(format!("--{}--\r\n", Self::BOUNDARY).as_bytes());
        self.parts
    }
}
