//! Variant generation: aspect-preserving resize followed by re-encoding.
//!
//! Decoding and encoding are CPU-bound and run on tokio's blocking pool. The
//! decoded source is shared read-only between all variants of an invocation.

use crate::profile::{OutputFormat, VariantSpec};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Quality used for JPEG output when a variant leaves it unset
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Unrecognized image format")]
    UnknownFormat,

    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("Source image has no pixels")]
    EmptyImage,

    #[error("Image task failed: {0}")]
    Task(String),
}

/// Decoded source image shared by every variant of one invocation
#[derive(Debug)]
pub struct SourceImage {
    image: DynamicImage,
    format: ImageFormat,
    extension: String,
}

impl SourceImage {
    /// Decode source bytes. The format is sniffed from the content, falling
    /// back to the key's extension.
    pub fn decode(bytes: &[u8], key_extension: Option<&str>) -> Result<Self, GenerationError> {
        let format = image::guess_format(bytes)
            .ok()
            .or_else(|| key_extension.and_then(ImageFormat::from_extension))
            .ok_or(GenerationError::UnknownFormat)?;

        let image = image::load_from_memory_with_format(bytes, format)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(GenerationError::EmptyImage);
        }

        let extension = key_extension
            .filter(|ext| !ext.is_empty())
            .map(str::to_string)
            .or_else(|| format.extensions_str().first().map(|ext| ext.to_string()))
            .unwrap_or_default();

        Ok(Self {
            image,
            format,
            extension,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

/// An encoded derivative ready for upload
#[derive(Debug, Clone)]
pub struct GeneratedVariant {
    pub label: String,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Extension of the destination filename
    pub extension: String,
    pub content_type: &'static str,
}

/// Height that keeps the source aspect ratio at `target_width`
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = (height as f64 * target_width as f64 / width as f64).round() as u32;
    scaled.max(1)
}

/// Produce one derivative from a decoded source.
///
/// Pure function of the source pixels and the variant settings: the same inputs always
/// yield the same bytes.
pub fn generate(source: &SourceImage, spec: &VariantSpec) -> Result<GeneratedVariant, GenerationError> {
    let (width, height) = source.dimensions();
    let target_height = scaled_height(width, height, spec.target_width);

    let resized = source
        .image
        .resize_exact(spec.target_width, target_height, FilterType::Lanczos3);

    let (data, extension, encoded_format) = match (spec.output_format, source.format) {
        (OutputFormat::Jpeg, _) => (
            encode_jpeg(&resized, spec.quality.unwrap_or(DEFAULT_JPEG_QUALITY))?,
            "jpeg".to_string(),
            ImageFormat::Jpeg,
        ),
        (OutputFormat::SameAsSource, ImageFormat::Jpeg) => (
            encode_jpeg(&resized, DEFAULT_JPEG_QUALITY)?,
            source.extension.clone(),
            ImageFormat::Jpeg,
        ),
        (OutputFormat::SameAsSource, format) => {
            let mut buffer = Vec::new();
            resized.write_to(&mut Cursor::new(&mut buffer), format)?;
            (buffer, source.extension.clone(), format)
        }
    };

    debug!(
        label = %spec.label,
        width = spec.target_width,
        height = target_height,
        size_bytes = data.len(),
        "Generated variant"
    );

    Ok(GeneratedVariant {
        label: spec.label.clone(),
        data: Bytes::from(data),
        width: spec.target_width,
        height: target_height,
        content_type: content_type(encoded_format),
        extension,
    })
}

/// Content type of the bytes actually encoded; the key's extension may disagree
pub fn content_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::Ico => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, GenerationError> {
    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();

    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;

    Ok(buffer)
}

/// Decode on the blocking pool
#[instrument(skip(bytes), fields(size_bytes = bytes.len()))]
pub async fn decode_source(
    bytes: Bytes,
    key_extension: Option<String>,
) -> Result<Arc<SourceImage>, GenerationError> {
    tokio::task::spawn_blocking(move || SourceImage::decode(&bytes, key_extension.as_deref()))
        .await
        .map_err(|e| GenerationError::Task(e.to_string()))?
        .map(Arc::new)
}

/// Generate one variant on the blocking pool
pub async fn generate_variant(
    source: Arc<SourceImage>,
    spec: VariantSpec,
) -> Result<GeneratedVariant, GenerationError> {
    tokio::task::spawn_blocking(move || generate(&source, &spec))
        .await
        .map_err(|e| GenerationError::Task(e.to_string()))?
}
