// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Image loading, resizing, and base64-encoding utilities.
//!
//! Converts local image files into data URLs that can be embedded directly
//! in multimodal LLM API requests (used by `chapo_tools::ReadFileTool`).
//!
//! ## Size limits
//! Images wider than [`MAX_WIDTH`] or taller than [`MAX_HEIGHT`] are downscaled
//! while preserving aspect ratio before encoding.  This keeps request payloads
//! reasonable and aligns with provider limits (most cap uploads at ~20 MB).
//!
//! ## Caching
//! [`load_image`] transparently caches encoded results in an in-process
//! LRU cache keyed on the SHA-256 of the raw file bytes.  Repeated calls with
//! the same file (or different paths to identical content) avoid the decode →
//! resize → re-encode work.  The cache holds up to [`CACHE_CAPACITY`] entries.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use sha2::Digest as _;

pub use error::ImageError;

mod error;

// ─── LRU image cache ──────────────────────────────────────────────────────────

/// Maximum number of encoded images held in the in-process LRU cache.
pub const CACHE_CAPACITY: usize = 32;

type CacheKey = [u8; 32]; // SHA-256 digest

fn image_cache() -> &'static Mutex<lru::LruCache<CacheKey, EncodedImage>> {
    static CACHE: OnceLock<Mutex<lru::LruCache<CacheKey, EncodedImage>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(lru::LruCache::new(
            NonZeroUsize::new(CACHE_CAPACITY).unwrap(),
        ))
    })
}

/// Maximum image width in pixels before downscaling.
pub const MAX_WIDTH: u32 = 2048;
/// Maximum image height in pixels before downscaling.
pub const MAX_HEIGHT: u32 = 2048;

/// An image that has been loaded, (optionally) resized, and encoded as base64.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// MIME type, e.g. `"image/png"` or `"image/jpeg"`.
    pub mime_type: String,
    /// Raw bytes of the (possibly re-encoded) image.
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    /// Return a data URL: `data:<mime>;base64,<b64>`.
    pub fn into_data_url(self) -> String {
        let encoded = B64.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, encoded)
    }

    /// Return the base64-encoded string only (no `data:…;base64,` prefix).
    pub fn to_base64(&self) -> String {
        B64.encode(&self.bytes)
    }
}

/// Load an image from `path`, resize if needed, and return an [`EncodedImage`].
///
/// Results are transparently cached by content hash: if the same image bytes
/// have been loaded before (even from a different path) the cached result is
/// returned immediately, avoiding redundant decode → resize → re-encode work.
///
/// PNG images are re-encoded as PNG; everything else is re-encoded as JPEG.
pub fn load_image(path: &Path) -> Result<EncodedImage, ImageError> {
    let raw = std::fs::read(path).map_err(|e| ImageError::Io(path.display().to_string(), e))?;

    // Content-addressed cache lookup.
    let key: CacheKey = sha2::Sha256::digest(&raw).into();
    if let Ok(mut cache) = image_cache().lock() {
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }
    }

    let result = encode_image_bytes(&raw, path)?;

    if let Ok(mut cache) = image_cache().lock() {
        cache.put(key, result.clone());
    }

    Ok(result)
}

/// Decode, resize, and re-encode raw image bytes.
///
/// `hint_path` is used only for format detection (extension fallback) and
/// error messages; the bytes themselves are the source of truth.
fn encode_image_bytes(raw: &[u8], hint_path: &Path) -> Result<EncodedImage, ImageError> {
    // Detect format from bytes first, fall back to extension.
    let fmt = image::guess_format(raw)
        .or_else(|_| {
            let ext = hint_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            match ext.as_str() {
                "jpg" | "jpeg" => Ok(image::ImageFormat::Jpeg),
                "png" => Ok(image::ImageFormat::Png),
                "gif" => Ok(image::ImageFormat::Gif),
                "webp" => Ok(image::ImageFormat::WebP),
                _ => Err(image::ImageError::Unsupported(
                    image::error::UnsupportedError::from_format_and_kind(
                        image::error::ImageFormatHint::Unknown,
                        image::error::UnsupportedErrorKind::Format(
                            image::error::ImageFormatHint::Unknown,
                        ),
                    ),
                )),
            }
        })
        .map_err(|_| ImageError::UnsupportedFormat(hint_path.display().to_string()))?;

    let use_png = fmt == image::ImageFormat::Png;

    let img = image::load_from_memory_with_format(raw, fmt)
        .map_err(|e| ImageError::Decode(hint_path.display().to_string(), e.to_string()))?;

    let img = resize_if_needed(img);

    let mut out = Cursor::new(Vec::new());
    if use_png {
        img.write_to(&mut out, image::ImageFormat::Png)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(EncodedImage {
            mime_type: "image/png".into(),
            bytes: out.into_inner(),
        })
    } else {
        img.write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(EncodedImage {
            mime_type: "image/jpeg".into(),
            bytes: out.into_inner(),
        })
    }
}

/// Parse a data URL and return `(mime_type, raw_bytes)`.
///
/// Accepts `data:<mime>;base64,<data>` format.
pub fn parse_data_url(data_url: &str) -> Result<(String, Vec<u8>), ImageError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| ImageError::InvalidDataUrl(data_url.to_string()))?;
    let (meta, b64) = rest
        .split_once(',')
        .ok_or_else(|| ImageError::InvalidDataUrl(data_url.to_string()))?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    let bytes = B64
        .decode(b64)
        .map_err(|e| ImageError::Base64(e.to_string()))?;
    Ok((mime, bytes))
}

fn resize_if_needed(img: image::DynamicImage) -> image::DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w <= MAX_WIDTH && h <= MAX_HEIGHT {
        return img;
    }
    let ratio_w = MAX_WIDTH as f64 / w as f64;
    let ratio_h = MAX_HEIGHT as f64 / h as f64;
    let ratio = ratio_w.min(ratio_h);
    let new_w = ((w as f64 * ratio).round() as u32).max(1);
    let new_h = ((h as f64 * ratio).round() as u32).max(1);
    img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
}

/// Return whether the given file extension belongs to a supported image format.
pub fn is_image_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" | "tif"
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────
