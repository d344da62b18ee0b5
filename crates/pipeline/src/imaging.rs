//! Base64 image resize codec.
//!
//! Images travel as standard-alphabet base64 text. Resizing decodes,
//! scales with a Lanczos3 filter to the exact target size, and
//! re-encodes as JPEG. All decoding and encoding runs on the blocking
//! thread pool.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use sdrelay_core::types::Dimensions;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("Image task failed: {0}")]
    Task(String),
}

/// Decode base64 text (optionally a `data:` URL) into an image.
pub fn decode(data: &str) -> Result<DynamicImage, ImageError> {
    let payload = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = STANDARD.decode(payload.trim())?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Encode an image as JPEG base64.
pub fn encode_jpeg(image: &DynamicImage) -> Result<String, ImageError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(STANDARD.encode(buffer.into_inner()))
}

/// Pixel size of a base64 image.
pub fn dimensions_of(data: &str) -> Result<Dimensions, ImageError> {
    let (width, height) = decode(data)?.dimensions();
    Ok(Dimensions::new(width, height))
}

/// Resize one base64 image to exactly `size`. Blocking.
pub fn resize(data: &str, size: Dimensions) -> Result<String, ImageError> {
    let image = decode(data)?;
    let resized = image.resize_exact(size.width, size.height, FilterType::Lanczos3);
    encode_jpeg(&resized)
}

/// Resize every image to `size` on the blocking pool, keeping order.
pub async fn resize_all(images: Vec<String>, size: Dimensions) -> Result<Vec<String>, ImageError> {
    if images.is_empty() {
        return Ok(images);
    }
    let count = images.len();
    let resized = tokio::task::spawn_blocking(move || {
        images
            .iter()
            .map(|data| resize(data, size))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| ImageError::Task(e.to_string()))??;

    tracing::debug!(count, size = %size, "Resized images");
    Ok(resized)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use image::{Rgb, RgbImage};

    use super::*;

    /// A smooth gradient, so JPEG artefacts stay small.
    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        }))
    }

    fn png_base64(image: &DynamicImage) -> String {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        STANDARD.encode(buffer.into_inner())
    }

    #[test]
    fn resize_hits_exact_target() {
        let source = png_base64(&gradient(64, 32));
        let out = resize(&source, Dimensions::new(100, 50)).unwrap();
        assert_eq!(dimensions_of(&out).unwrap(), Dimensions::new(100, 50));
    }

    #[test]
    fn resize_to_own_size_is_pixel_equivalent() {
        let original = gradient(48, 48);
        let out = resize(&png_base64(&original), Dimensions::new(48, 48)).unwrap();
        let decoded = decode(&out).unwrap().to_rgb8();
        let original = original.to_rgb8();

        let max_delta = decoded
            .pixels()
            .zip(original.pixels())
            .flat_map(|(a, b)| a.0.iter().zip(b.0.iter()).map(|(x, y)| x.abs_diff(*y)))
            .max()
            .unwrap();
        assert!(max_delta <= 24, "max channel delta {max_delta}");
    }

    #[test]
    fn accepts_data_urls() {
        let source = format!("data:image/png;base64,{}", png_base64(&gradient(8, 8)));
        assert_eq!(dimensions_of(&source).unwrap(), Dimensions::new(8, 8));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_matches!(decode("not base64!"), Err(ImageError::Base64(_)));
        assert_matches!(decode("aGVsbG8="), Err(ImageError::Codec(_)));
    }

    #[tokio::test]
    async fn resize_all_keeps_order() {
        let a = png_base64(&gradient(10, 20));
        let b = png_base64(&gradient(30, 40));
        let out = resize_all(vec![a, b], Dimensions::new(16, 16)).await.unwrap();
        assert_eq!(out.len(), 2);
        for image in &out {
            assert_eq!(dimensions_of(image).unwrap(), Dimensions::new(16, 16));
        }
    }
}
