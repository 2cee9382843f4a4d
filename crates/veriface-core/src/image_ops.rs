//! Grayscale image helpers: decode, histogram equalization and resizing.

use crate::types::{FaceError, PixelRect};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Decode arbitrary upload bytes into an 8-bit grayscale image.
pub fn decode(bytes: &[u8]) -> Result<GrayImage, FaceError> {
    if bytes.is_empty() {
        return Err(FaceError::Decode("empty image payload".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| FaceError::Decode(e.to_string()))?;
    let gray = img.to_luma8();
    if gray.width() == 0 || gray.height() == 0 {
        return Err(FaceError::Decode("image has zero size".into()));
    }
    Ok(gray)
}

/// Global histogram equalization in-place.
///
/// Builds the cumulative distribution of intensities and remaps every pixel so
/// the output histogram is approximately flat. Uniform images are unchanged.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let mut cdf = [0usize; 256];
    let mut running = 0usize;
    for (i, &count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
    let denom = total - cdf_min;
    if denom == 0 {
        return;
    }

    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[v].saturating_sub(cdf_min)) as f32 / denom as f32 * 255.0;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Bicubic (Catmull-Rom) resize to a square `size × size` image.
pub fn upscale(gray: &GrayImage, size: u32) -> GrayImage {
    imageops::resize(gray, size, size, FilterType::CatmullRom)
}

/// Bilinear resize used for pyramid levels.
pub fn downscale(gray: &GrayImage, width: u32, height: u32) -> GrayImage {
    imageops::resize(gray, width, height, FilterType::Triangle)
}

/// Copy a rectangle out of the image. `rect` must lie inside the image.
pub fn crop(gray: &GrayImage, rect: PixelRect) -> GrayImage {
    imageops::crop_imm(gray, rect.x, rect.y, rect.width, rect.height).to_image()
}

/// Read a pixel, clamping out-of-range coordinates to the nearest edge.
#[inline]
pub fn pixel_clamped(gray: &GrayImage, x: i32, y: i32) -> u8 {
    let cx = x.clamp(0, gray.width() as i32 - 1) as u32;
    let cy = y.clamp(0, gray.height() as i32 - 1) as u32;
    gray.get_pixel(cx, cy).0[0]
}
