//! Frame type and pixel-format conversion to RGB.

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

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len("YUYV", yuyv, expected)?;

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(quad[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(quad[2], u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected,
        actual: yuyv.len(),
    })
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

/// Expand 8-bit grayscale (common on IR cameras) to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize;
    check_len("GREY", gray, expected)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = gray[y as usize * width as usize + x as usize];
        image::Rgb([v, v, v])
    }))
}

/// Packed 24-bit RGB, copied as-is.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize * 3;
    check_len("RGB3", buf, expected)?;
    RgbImage::from_raw(width, height, buf[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        format: "RGB3",
        expected,
        actual: buf.len(),
    })
}
