//! Image preprocessing for overlay OCR
//!
//! Crops the overlay region out of a frame and applies optional contrast and
//! brightness enhancement. The overlay strip is small, low-contrast and
//! stylized, so boosting it before detection markedly improves read rates.

use image::RgbaImage;

/// Crop a pixel rectangle out of an image, clamped to the image bounds.
pub fn crop(img: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
    let (img_w, img_h) = img.dimensions();
    let x = x.min(img_w.saturating_sub(1));
    let y = y.min(img_h.saturating_sub(1));
    let width = width.min(img_w - x).max(1);
    let height = height.min(img_h - y).max(1);

    image::imageops::crop_imm(img, x, y, width, height).to_image()
}

/// Apply contrast then brightness enhancement in place.
///
/// Contrast is scaled about the 128 midpoint, brightness is a multiplicative
/// gain. A factor of 1.0 leaves the channel untouched.
pub fn enhance(img: &mut RgbaImage, contrast: f32, brightness: f32) {
    let data: &mut [u8] = img.as_mut();
    if (contrast - 1.0).abs() > 0.01 {
        apply_contrast(data, contrast);
    }
    if (brightness - 1.0).abs() > 0.01 {
        apply_brightness(data, brightness);
    }
}

/// Contrast about the midpoint (128); factor > 1.0 increases contrast.
fn apply_contrast(data: &mut [u8], factor: f32) {
    for chunk in data.chunks_exact_mut(4) {
        for i in 0..3 {
            let val = chunk[i] as f32;
            let adjusted = ((val - 128.0) * factor + 128.0).clamp(0.0, 255.0);
            chunk[i] = adjusted as u8;
        }
        // Alpha channel unchanged
    }
}

/// Multiplicative brightness gain; factor > 1.0 brightens.
fn apply_brightness(data: &mut [u8], factor: f32) {
    for chunk in data.chunks_exact_mut(4) {
        for i in 0..3 {
            let adjusted = (chunk[i] as f32 * factor).clamp(0.0, 255.0);
            chunk[i] = adjusted as u8;
        }
        // Alpha channel unchanged
    }
}
