//! Raster decoding for uploaded media.

use image::{ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image is empty")]
    Empty,
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to decode image: {0}")]
    Corrupt(#[from] image::ImageError),
    #[error("image dimensions are zero")]
    ZeroDimensions,
}

/// Raster formats accepted for face analysis.
const SUPPORTED_FORMATS: [ImageFormat; 6] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Gif,
    ImageFormat::Tiff,
];

/// Resolve the decoder format from an optional MIME hint, falling back to
/// sniffing the leading bytes when the hint is absent or not a raster type.
fn resolve_format(bytes: &[u8], mime: Option<&str>) -> Result<ImageFormat, DecodeError> {
    let hinted = mime
        .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase())
        .and_then(|m| ImageFormat::from_mime_type(m))
        .filter(|f| SUPPORTED_FORMATS.contains(f));

    if let Some(format) = hinted {
        return Ok(format);
    }

    let guessed = image::guess_format(bytes)?;
    if SUPPORTED_FORMATS.contains(&guessed) {
        Ok(guessed)
    } else {
        Err(DecodeError::UnsupportedFormat(format!("{guessed:?}")))
    }
}

/// Decode image bytes into an 8-bit RGB buffer.
pub fn decode_rgb(bytes: &[u8], mime: Option<&str>) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let format = resolve_format(bytes, mime)?;
    let image = match image::load_from_memory_with_format(bytes, format) {
        Ok(image) => image,
        // A wrong MIME hint should not reject a readable file.
        Err(e) if mime.is_some() => {
            tracing::debug!(?format, error = %e, "hinted format failed; sniffing bytes");
            image::load_from_memory_with_format(bytes, resolve_format(bytes, None)?)?
        }
        Err(e) => return Err(e.into()),
    };

    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DecodeError::ZeroDimensions);
    }
    Ok(rgb)
}
