//! Writing rendered images to disk.
//!
//! Color targets are `Rgba8Unorm`, so readback data goes straight into an
//! [`image::RgbaImage`]. Normalized depth (`R32Float`) is written as 8-bit
//! grayscale.

use std::path::Path;

use image::{ImageBuffer, Luma, Rgba};

use crate::gpu::{GpuBackend, TexelFormat, TextureHandle};

/// Error type for snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to save image: {0}")]
    IoError(#[from] std::io::Error),

    #[error("image encoding error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("{actual} bytes do not make a {width}x{height} image")]
    InvalidImageData {
        width: u32,
        height: u32,
        actual: usize,
    },

    #[error(transparent)]
    Render(#[from] crate::error::RenderError),
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// Saves tightly packed RGBA8 pixels as PNG or JPEG, chosen by extension.
pub fn save_rgba(
    path: impl AsRef<Path>,
    data: &[u8],
    width: u32,
    height: u32,
) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, data.to_vec())
        .ok_or(SnapshotError::InvalidImageData {
            width,
            height,
            actual: data.len(),
        })?;

    match extension(path).as_str() {
        "png" => img.save_with_format(path, image::ImageFormat::Png)?,
        "jpg" | "jpeg" => {
            // JPEG has no alpha
            let rgb = image::DynamicImage::ImageRgba8(img).to_rgb8();
            rgb.save_with_format(path, image::ImageFormat::Jpeg)?;
        }
        other => return Err(SnapshotError::UnsupportedFormat(other.to_string())),
    }
    log::info!("saved {width}x{height} image to {}", path.display());
    Ok(())
}

/// Converts normalized `f32` depth to 8-bit gray, near is dark.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn depth_to_gray(depth: &[f32]) -> Vec<u8> {
    depth
        .iter()
        .map(|d| (d.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect()
}

/// Saves normalized depth as a grayscale PNG.
pub fn save_depth(
    path: impl AsRef<Path>,
    depth: &[f32],
    width: u32,
    height: u32,
) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    let img: ImageBuffer<Luma<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width, height, depth_to_gray(depth)).ok_or(
            SnapshotError::InvalidImageData {
                width,
                height,
                actual: depth.len() * 4,
            },
        )?;
    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Encodes tightly packed RGBA8 pixels as PNG in memory.
pub fn encode_png(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, SnapshotError> {
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, data.to_vec())
        .ok_or(SnapshotError::InvalidImageData {
            width,
            height,
            actual: data.len(),
        })?;
    let mut buffer = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Reads a 2D texture back and saves it; `format` selects color or depth.
pub fn save_texture(
    gpu: &mut dyn GpuBackend,
    texture: TextureHandle,
    format: TexelFormat,
    size: [u32; 2],
    path: impl AsRef<Path>,
) -> Result<(), SnapshotError> {
    let bytes = gpu.read_texture(texture)?;
    match format {
        TexelFormat::R32Float | TexelFormat::Depth32Float => {
            let depth: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            save_depth(path, &depth, size[0], size[1])
        }
        TexelFormat::Rgba8Unorm => save_rgba(path, &bytes, size[0], size[1]),
        other => Err(SnapshotError::UnsupportedFormat(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_to_gray_clamps() {
        assert_eq!(depth_to_gray(&[-1.0, 0.0, 0.5, 1.0, 2.0]), vec![0, 0, 128, 255, 255]);
    }

    #[test]
    fn test_encode_png_signature() {
        let data = vec![255u8; 4 * 4 * 4];
        let png = encode_png(&data, 4, 4).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        let err = encode_png(&[0; 7], 2, 2).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidImageData { actual: 7, .. }));
    }

    #[test]
    fn test_unknown_extension() {
        let dir = std::env::temp_dir().join("volray_snapshot.bmpx");
        let err = save_rgba(&dir, &[0; 4], 1, 1).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsupportedFormat(ref e) if e == "bmpx"));
    }
}
