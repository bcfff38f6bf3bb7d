//! Pure pixel operations shared by inference post-processing and merge mode.
//!
//! Every function works on an owned [`RgbaImage`] so the primitives compose
//! without touching the network or the filesystem.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{imageops, DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::{result_name, ImageAsset};

pub const DEFAULT_QUALITY: u8 = 100;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image as {format}: {source}")]
    Encode {
        format: OutputFormat,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Self::Png,
            _ => Self::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jpeg => f.write_str("JPEG"),
            Self::Png => f.write_str("PNG"),
        }
    }
}

/// Clamp an arbitrary user-supplied quality into the JPEG range.
pub fn clamp_quality(quality: i64) -> u8 {
    quality.clamp(1, 100) as u8
}

pub fn decode(bytes: &[u8]) -> Result<RgbaImage, TransformError> {
    image::load_from_memory(bytes)
        .map(|decoded| decoded.to_rgba8())
        .map_err(TransformError::Decode)
}

/// Column `x` of the output is column `width - 1 - x` of the input.
pub fn mirror_horizontal(image: &RgbaImage) -> RgbaImage {
    imageops::flip_horizontal(image)
}

/// Left or right half (`width / 2`, floored) at full height.
pub fn crop_half(image: &RgbaImage, keep_left: bool) -> RgbaImage {
    let half = image.width() / 2;
    let x = if keep_left { 0 } else { image.width() - half };
    imageops::crop_imm(image, x, 0, half, image.height()).to_image()
}

/// Place `left` at the origin and `right` immediately after it.
///
/// The canvas is as tall as the taller input; rows below the shorter image
/// stay fully transparent.
pub fn merge_side_by_side(left: &RgbaImage, right: &RgbaImage) -> RgbaImage {
    let width = left.width() + right.width();
    let height = left.height().max(right.height());
    let mut canvas = RgbaImage::new(width, height);
    imageops::replace(&mut canvas, left, 0, 0);
    imageops::replace(&mut canvas, right, i64::from(left.width()), 0);
    canvas
}

pub fn encode(
    image: &RgbaImage,
    format: OutputFormat,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let mut buffer = Cursor::new(Vec::new());
    let rgba = DynamicImage::ImageRgba8(image.clone());
    let result = match format {
        // JPEG has no alpha channel.
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(rgba.to_rgb8()).write_with_encoder(
            JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)),
        ),
        OutputFormat::Png => rgba.write_with_encoder(PngEncoder::new(&mut buffer)),
    };
    result.map_err(|source| TransformError::Encode { format, source })?;
    Ok(buffer.into_inner())
}

/// Inference post-processing: undo the service's horizontal flip and
/// re-encode as JPEG.
pub fn mirror_and_reencode(bytes: &[u8], quality: u8) -> Result<Vec<u8>, TransformError> {
    let decoded = decode(bytes)?;
    encode(&mirror_horizontal(&decoded), OutputFormat::Jpeg, quality)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub mirror_left: bool,
    pub format: OutputFormat,
    pub quality: u8,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            mirror_left: true,
            format: OutputFormat::Jpeg,
            quality: DEFAULT_QUALITY,
        }
    }
}

/// Merge mode: left half of `left` (optionally mirrored) beside the right half of `right`.
pub fn merge_pair(
    left: &[u8],
    right: &[u8],
    options: MergeOptions,
) -> Result<Vec<u8>, TransformError> {
    let left = crop_half(&decode(left)?, true);
    let left = if options.mirror_left {
        mirror_horizontal(&left)
    } else {
        left
    };
    let right = crop_half(&decode(right)?, false);
    encode(&merge_side_by_side(&left, &right), options.format, options.quality)
}

/// [`merge_pair`] producing a named artifact.
pub fn merge_assets(
    left: &ImageAsset,
    right: &ImageAsset,
    name_prefix: &str,
    options: MergeOptions,
) -> Result<ImageAsset, TransformError> {
    let bytes = merge_pair(&left.bytes, &right.bytes, options)?;
    Ok(ImageAsset::new(
        bytes,
        result_name(name_prefix, options.format.extension()),
    ))
}

#[cfg(test)]
pub(crate) fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, image::Rgba(rgba))
}
