//! Image sharpness metric used by the enrollment quality gate.

use image::{GrayImage, RgbImage};

/// Variance of the 4-neighbour Laplacian over the interior pixels.
///
/// Blurry images have little high-frequency energy and score low. Images
/// smaller than 3×3 score 0.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

pub fn sharpness(image: &RgbImage) -> f64 {
    laplacian_variance(&image::imageops::grayscale(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_uniform_image_has_zero_variance() {
        let gray = GrayImage::from_pixel(16, 16, Luma([128]));
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert!(laplacian_variance(&gray) > 10_000.0);
    }

    #[test]
    fn test_gradient_is_smoother_than_checkerboard() {
        let gradient = GrayImage::from_fn(16, 16, |x, _| Luma([(x * 16) as u8]));
        let checker = GrayImage::from_fn(16, 16, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert!(laplacian_variance(&gradient) < laplacian_variance(&checker));
    }

    #[test]
    fn test_tiny_image_scores_zero() {
        assert_eq!(laplacian_variance(&GrayImage::new(2, 2)), 0.0);
    }
}
