//! Scan preparation: decode an uploaded image, bound its size and encode it
//! as a base64 PNG `ImageData` for the vision backend.
//!
//! Scans are re-encoded as PNG regardless of the upload format: lossless
//! output keeps small print legible, and every provider accepts PNG.

use crate::document::FormatHint;
use crate::error::ExtractError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Longest edge sent to the vision backend, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 2048;

fn image_format(hint: FormatHint) -> Option<ImageFormat> {
    match hint {
        FormatHint::Png => Some(ImageFormat::Png),
        FormatHint::Jpeg => Some(ImageFormat::Jpeg),
        FormatHint::Tiff => Some(ImageFormat::Tiff),
        FormatHint::Bmp => Some(ImageFormat::Bmp),
        FormatHint::Pdf => None,
    }
}

/// Decode image bytes of the given format.
pub fn decode_scan(bytes: &[u8], hint: FormatHint) -> Result<DynamicImage, ExtractError> {
    let format = image_format(hint)
        .ok_or_else(|| ExtractError::UnsupportedFormat(format!("{hint} is not an image format")))?;
    image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ExtractError::CorruptFile(format!("cannot decode {hint} image: {e}")))
}

/// Downscale so that neither edge exceeds [`MAX_IMAGE_DIMENSION`],
/// preserving aspect ratio. Smaller images are returned unchanged.
pub fn bound_dimensions(img: DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w.max(h) <= MAX_IMAGE_DIMENSION {
        return img;
    }
    debug!("Downscaling {}x{} scan to fit {} px", w, h, MAX_IMAGE_DIMENSION);
    img.resize(MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION, FilterType::Triangle)
}

/// Encode an image as a high-detail base64 PNG.
pub fn encode_scan(img: &DynamicImage) -> Result<ImageData, ExtractError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ExtractError::CorruptFile(format!("cannot re-encode image: {e}")))?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded scan → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Decode, bound and encode in one step.
pub fn prepare_scan(bytes: &[u8], hint: FormatHint) -> Result<ImageData, ExtractError> {
    let img = bound_dimensions(decode_scan(bytes, hint)?);
    encode_scan(&img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn small_scan_is_encoded_as_png() {
        let data = prepare_scan(&png_bytes(10, 10), FormatHint::Png).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(decoded.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn large_scan_is_bounded() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(4096, 1024));
        let bounded = bound_dimensions(img);
        assert_eq!(bounded.width(), MAX_IMAGE_DIMENSION);
        assert_eq!(bounded.height(), 512);
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        let err = decode_scan(b"\x89PNG not really", FormatHint::Png).unwrap_err();
        assert!(matches!(err, ExtractError::CorruptFile(_)));
    }

    #[test]
    fn pdf_is_not_an_image() {
        assert!(matches!(
            decode_scan(b"%PDF", FormatHint::Pdf),
            Err(ExtractError::UnsupportedFormat(_))
        ));
    }
}
