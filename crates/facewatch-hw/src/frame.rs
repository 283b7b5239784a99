//! Frame type and pixel-format conversion to RGB8.

use image::RgbImage;

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Convert packed YUYV (4:2:2) to RGB8 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb: Vec<u8> = gray[..expected].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

/// 16-bit little-endian grayscale, downscaled to 8 bits and replicated.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    let gray: Vec<u8> = buf[..expected]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect();
    grey_to_rgb(&gray, width, height)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("YUYV width must be even, got {0}")]
    OddWidth(u32),
}
