//! Frame types passed between capture threads, buffers and sinks.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Supported pixel formats for camera frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale (Y800)
    Mono8,
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb => 3,
        }
    }

    /// Name of the matching ffmpeg raw pixel format.
    pub fn ffmpeg_pix_fmt(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "gray",
            PixelFormat::Rgb => "rgb24",
        }
    }
}

/// An image as delivered by a camera.
///
/// The pixel buffer is reference counted so a frame can be handed to a sink
/// and to the calibration queue without copying. Frames are never mutated
/// after creation.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    data: Arc<[u8]>,
}

impl Frame {
    /// Creates a black frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; size].into(),
        }
    }

    /// Creates a frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(anyhow!(
                "Frame data has {} bytes, expected {} for {}x{} {:?}",
                data.len(),
                expected,
                width,
                height,
                format
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            data: data.into(),
        })
    }

    /// Raw pixel bytes, row-major without padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luminance of one pixel, or `None` outside the frame.
    pub fn luma(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * self.format.bytes_per_pixel();
        match self.format {
            PixelFormat::Mono8 => self.data.get(idx).copied(),
            PixelFormat::Rgb => {
                let px = self.data.get(idx..idx + 3)?;
                // ITU-R BT.601 weights, integer form
                let y = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
                Some(y as u8)
            }
        }
    }

    /// Mean luminance of the square neighborhood of `radius` pixels around
    /// `(x, y)`, clipped to the frame. A radius of 0 samples the single pixel.
    pub fn sample(&self, x: u32, y: u32, radius: u32) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let x1 = (x + radius).min(self.width - 1);
        let y1 = (y + radius).min(self.height - 1);

        let mut sum = 0u64;
        let mut count = 0u64;
        for yy in y0..=y1 {
            for xx in x0..=x1 {
                if let Some(v) = self.luma(xx, yy) {
                    sum += v as u64;
                    count += 1;
                }
            }
        }
        (count > 0).then(|| sum as f64 / count as f64)
    }

    /// Writes the frame as an image file; the format follows the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let color = match self.format {
            PixelFormat::Mono8 => image::ColorType::L8,
            PixelFormat::Rgb => image::ColorType::Rgb8,
        };
        image::save_buffer(path, &self.data, self.width, self.height, color)
            .with_context(|| format!("Failed to save frame to {:?}", path))
    }
}

/// A captured frame with its host timestamp and capture cycle number.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub frame: Frame,
    /// Seconds since the rig epoch
    pub timestamp: f64,
    /// Index of the capture cycle; failed grabs leave a gap
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_rejects_wrong_length() {
        assert!(Frame::from_data(2, 2, PixelFormat::Mono8, vec![0; 3]).is_err());
        assert!(Frame::from_data(2, 2, PixelFormat::Rgb, vec![0; 12]).is_ok());
    }

    #[test]
    fn test_rgb_luma() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = Frame::from_data(2, 2, PixelFormat::Rgb, rgb_data).unwrap();
        assert_eq!(frame.luma(0, 0), Some(76));
        assert_eq!(frame.luma(1, 0), Some(149));
        assert_eq!(frame.luma(1, 1), Some(255));
        assert_eq!(frame.luma(2, 0), None);
    }

    #[test]
    fn test_sample_neighborhood() {
        let data: Vec<u8> = (0..9).map(|v| v * 10).collect();
        let frame = Frame::from_data(3, 3, PixelFormat::Mono8, data).unwrap();
        assert_eq!(frame.sample(1, 1, 0), Some(40.0));
        assert_eq!(frame.sample(1, 1, 1), Some(40.0));
        // clipped at the corner: pixels 0, 10, 30, 40
        assert_eq!(frame.sample(0, 0, 1), Some(20.0));
        assert_eq!(frame.sample(5, 5, 1), None);
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.png");
        Frame::new(4, 3, PixelFormat::Mono8).save(&path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));
    }
}
