//! Image-decode cache for watermark content.
//!
//! Fetches watermark images from HTTPS URLs or a preloaded in-memory store
//! and caches the decoded RGBA result keyed by source. The cache uses LRU
//! eviction with a configurable TTL and is cleared on `dispose`, not on
//! every render.
//!
//! # Supported Sources
//!
//! - `https://example.com/image.png` - fetched over HTTPS
//! - `mem://name` - preloaded via [`ImageCache::preload`] (headless hosts
//!   and tests)

use crate::error::{ErrorCode, Result, WatermarkError};
use image::{DynamicImage, ImageFormat};
use moka::future::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the image cache.
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Maximum number of cached images.
    pub max_entries: u64,
    /// Time-to-live for cached images.
    pub ttl: Duration,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Parsed source location for watermark images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// HTTPS URL source.
    Https(String),
    /// Preloaded in-memory source.
    Memory(String),
}

impl ImageSource {
    /// Parse a source string.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the source uses an unsupported protocol.
    /// `http://` is intentionally rejected.
    pub fn parse(source: &str) -> Result<Self> {
        if source.starts_with("https://") {
            Ok(Self::Https(source.to_string()))
        } else if let Some(name) = source.strip_prefix("mem://") {
            if name.is_empty() {
                return Err(WatermarkError::new(
                    ErrorCode::ImageDecodeFailed,
                    format!("Invalid mem:// source: {source}. Expected mem://name"),
                ));
            }
            Ok(Self::Memory(name.to_string()))
        } else {
            Err(WatermarkError::new(
                ErrorCode::ImageDecodeFailed,
                format!("Unsupported source protocol: {source}. Use https:// or mem://"),
            ))
        }
    }

    /// Cache key for this source.
    pub fn cache_key(&self) -> String {
        match self {
            Self::Https(url) => url.clone(),
            Self::Memory(name) => format!("mem://{name}"),
        }
    }
}

/// Decoded image with its natural dimensions.
#[derive(Clone)]
pub struct DecodedImage {
    pub image: Arc<DynamicImage>,
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("dimensions", &(self.image.width(), self.image.height()))
            .finish()
    }
}

impl DecodedImage {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// Natural (intrinsic) dimensions of the decoded image.
    pub fn natural_size(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

/// Image fetcher and decode cache shared across renderer backends.
#[derive(Clone)]
pub struct ImageCache {
    cache: Cache<String, DecodedImage>,
    preloaded: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    http_client: reqwest::Client,
}

impl ImageCache {
    /// Create a cache with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(config: ImageCacheConfig) -> Result<Self> {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                WatermarkError::new(
                    ErrorCode::FetchFailed,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            cache,
            preloaded: Arc::new(RwLock::new(HashMap::new())),
            http_client,
        })
    }

    /// Register encoded image bytes under a `mem://name` source.
    pub fn preload(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.preloaded.write().insert(name.into(), bytes);
    }

    /// Fetch and decode an image, returning the cached copy when present.
    pub async fn fetch(&self, source: &str) -> Result<DecodedImage> {
        let parsed = ImageSource::parse(source)?;
        let cache_key = parsed.cache_key();

        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let bytes = match &parsed {
            ImageSource::Https(url) => self.fetch_from_https(url).await?,
            ImageSource::Memory(name) => {
                self.preloaded.read().get(name).cloned().ok_or_else(|| {
                    WatermarkError::new(
                        ErrorCode::ImageDecodeFailed,
                        format!("No preloaded image named '{name}'"),
                    )
                })?
            }
        };

        let format = detect_image_format(&bytes, &cache_key)?;
        let image = image::load(Cursor::new(bytes), format).map_err(|e| {
            WatermarkError::new(
                ErrorCode::ImageDecodeFailed,
                format!("Failed to decode image: {e}"),
            )
            .with_context("source", source)
        })?;

        let decoded = DecodedImage::new(image);
        self.cache.insert(cache_key, decoded.clone()).await;
        Ok(decoded)
    }

    async fn fetch_from_https(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http_client.get(url).send().await.map_err(|e| {
            WatermarkError::new(ErrorCode::FetchFailed, format!("HTTP fetch failed: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(WatermarkError::new(
                ErrorCode::FetchFailed,
                format!("HTTP request failed with status: {}", response.status()),
            ));
        }

        let bytes = response.bytes().await.map_err(|e| {
            WatermarkError::new(
                ErrorCode::FetchFailed,
                format!("Failed to read HTTP body: {e}"),
            )
        })?;

        Ok(bytes.to_vec())
    }

    /// Number of cached decoded images.
    pub fn cache_size(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Check whether a source is cached.
    pub async fn is_cached(&self, source: &str) -> bool {
        match ImageSource::parse(source) {
            Ok(parsed) => self.cache.get(&parsed.cache_key()).await.is_some(),
            Err(_) => false,
        }
    }

    /// Drop every cached image. Called on engine dispose.
    pub async fn dispose(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.preloaded.write().clear();
    }
}

/// Detect image format from magic bytes, falling back to the extension.
fn detect_image_format(data: &[u8], path: &str) -> Result<ImageFormat> {
    if let Ok(format) = image::guess_format(data) {
        return Ok(format);
    }

    let ext = path
        .rsplit('.')
        .next()
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => Ok(ImageFormat::Png),
        "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
        "gif" => Ok(ImageFormat::Gif),
        "webp" => Ok(ImageFormat::WebP),
        _ => Err(WatermarkError::new(
            ErrorCode::ImageDecodeFailed,
            format!("Unsupported image format: {ext}"),
        )),
    }
}
