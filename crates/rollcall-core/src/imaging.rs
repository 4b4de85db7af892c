//! Pixel-level transforms used by the extraction cascade: letterbox resize,
//! linear contrast/brightness and luma grayscale.
//!
//! All functions return new buffers; the source image is never modified.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// ITU-R BT.601 luma weights.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Letterbox padding colour.
const PAD_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Working resolution for one cascade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Placement of the scaled source inside a letterboxed canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

/// Fit `src` inside `target` keeping aspect ratio, centred on a black canvas.
///
/// Uses bilinear (triangle) filtering.
pub fn letterbox(src: &RgbImage, target: Resolution) -> (RgbImage, LetterboxInfo) {
    let (w, h) = src.dimensions();
    let scale = (target.width as f32 / w as f32).min(target.height as f32 / h as f32);

    let new_w = ((w as f32 * scale).round() as u32).clamp(1, target.width);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, target.height);
    let pad_x = (target.width - new_w) / 2;
    let pad_y = (target.height - new_h) / 2;

    let mut canvas = RgbImage::from_pixel(target.width, target.height, PAD_COLOR);
    if new_w == w && new_h == h {
        imageops::replace(&mut canvas, src, pad_x as i64, pad_y as i64);
    } else {
        let resized = imageops::resize(src, new_w, new_h, FilterType::Triangle);
        imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);
    }

    (canvas, LetterboxInfo { scale, pad_x, pad_y })
}

/// Per-pixel `out = clamp(alpha * p + beta)` on every channel.
pub fn adjust_contrast_brightness(src: &RgbImage, alpha: f32, beta: f32) -> RgbImage {
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = (alpha * i as f32 + beta).round().clamp(0.0, 255.0) as u8;
    }

    let mut out = src.clone();
    for px in out.pixels_mut() {
        px.0 = px.0.map(|c| lut[c as usize]);
    }
    out
}

/// Luma grayscale, replicated to three channels so detectors that expect
/// RGB input can consume it.
pub fn luma_grayscale(src: &RgbImage) -> RgbImage {
    let mut out = src.clone();
    for px in out.pixels_mut() {
        let [r, g, b] = px.0;
        let y = (LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32)
            .round()
            .clamp(0.0, 255.0) as u8;
        px.0 = [y, y, y];
    }
    out
}

/// Average luma (0.0–255.0).
pub fn mean_luma(img: &RgbImage) -> f32 {
    let n = (img.width() as usize) * (img.height() as usize);
    if n == 0 {
        return 0.0;
    }
    let total: f32 = img
        .pixels()
        .map(|p| LUMA_R * p[0] as f32 + LUMA_G * p[1] as f32 + LUMA_B * p[2] as f32)
        .sum();
    total / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    // Resampling may be off by one from float rounding.
    fn near(a: Rgb<u8>, b: Rgb<u8>) -> bool {
        a.0.iter().zip(b.0.iter()).all(|(&x, &y)| x.abs_diff(y) <= 1)
    }

    #[test]
    fn test_letterbox_wide_source() {
        let src = RgbImage::from_pixel(200, 100, Rgb([200, 10, 10]));
        let (out, info) = letterbox(&src, Resolution::new(320, 240));

        assert_eq!(out.dimensions(), (320, 240));
        assert!((info.scale - 1.6).abs() < 1e-6);
        // 200x100 → 320x160, 40 px bars top and bottom
        assert_eq!(info.pad_x, 0);
        assert_eq!(info.pad_y, 40);
        assert_eq!(*out.get_pixel(160, 10), PAD_COLOR);
        assert!(near(*out.get_pixel(160, 120), Rgb([200, 10, 10])));
        assert_eq!(*out.get_pixel(160, 230), PAD_COLOR);
    }

    #[test]
    fn test_letterbox_tall_source() {
        let src = RgbImage::from_pixel(100, 400, Rgb([1, 2, 3]));
        let (out, info) = letterbox(&src, Resolution::new(640, 480));
        assert_eq!(out.dimensions(), (640, 480));
        // 100x400 → 120x480
        assert_eq!(info.pad_y, 0);
        assert_eq!(info.pad_x, 260);
        assert_eq!(*out.get_pixel(5, 240), PAD_COLOR);
        assert!(near(*out.get_pixel(320, 240), Rgb([1, 2, 3])));
    }

    #[test]
    fn test_letterbox_uniform_stays_uniform() {
        let src = RgbImage::from_pixel(333, 250, Rgb([128, 128, 128]));
        let (out, info) = letterbox(&src, Resolution::new(480, 360));
        let x0 = info.pad_x;
        let y0 = info.pad_y;
        for y in y0 + 1..360 - y0 - 1 {
            for x in x0 + 1..480 - x0 - 1 {
                assert!(near(*out.get_pixel(x, y), Rgb([128, 128, 128])));
            }
        }
    }

    #[test]
    fn test_letterbox_does_not_touch_source() {
        let src = RgbImage::from_pixel(120, 120, Rgb([9, 9, 9]));
        let copy = src.clone();
        let _ = letterbox(&src, Resolution::new(320, 240));
        assert_eq!(src, copy);
    }

    #[test]
    fn test_contrast_brightness_linear() {
        let src = RgbImage::from_pixel(2, 2, Rgb([10, 100, 250]));
        let out = adjust_contrast_brightness(&src, 1.5, 20.0);
        // 10*1.5+20 = 35, 100*1.5+20 = 170, 250*1.5+20 → clamped 255
        assert_eq!(*out.get_pixel(0, 0), Rgb([35, 170, 255]));
    }

    #[test]
    fn test_contrast_identity() {
        let src = RgbImage::from_fn(16, 16, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 77]));
        assert_eq!(adjust_contrast_brightness(&src, 1.0, 0.0), src);
    }

    #[test]
    fn test_luma_weights() {
        let src = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(*luma_grayscale(&src).get_pixel(0, 0), Rgb([76, 76, 76]));

        let src = RgbImage::from_pixel(1, 1, Rgb([0, 255, 0]));
        assert_eq!(*luma_grayscale(&src).get_pixel(0, 0), Rgb([150, 150, 150]));

        let src = RgbImage::from_pixel(1, 1, Rgb([0, 0, 255]));
        assert_eq!(*luma_grayscale(&src).get_pixel(0, 0), Rgb([29, 29, 29]));
    }

    #[test]
    fn test_mean_luma() {
        let src = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        assert!((mean_luma(&src) - 100.0).abs() < 1e-3);
    }
}
