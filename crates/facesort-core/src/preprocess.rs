//! Image decoding and normalization ahead of face detection.
//!
//! Every strategy ends in a contrast-equalized, informationally grayscale
//! image carried in three identical RGB channels, which is the format both
//! detector tiers and the encoder consume.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SHARPEN_FACTOR: f32 = 2.0;
pub const DEFAULT_CLAHE_CLIP_LIMIT: f32 = 2.0;
pub const DEFAULT_CLAHE_TILES: u32 = 8;

// 3x3 smoothing kernel used by the sharpness enhancer: [[1,1,1],[1,5,1],[1,1,1]] / 13.
const SMOOTH_CENTER_WEIGHT: f32 = 5.0;
const SMOOTH_KERNEL_SUM: f32 = 13.0;

const UNSHARP_ORIGINAL_WEIGHT: f32 = 1.5;
const UNSHARP_BLUR_WEIGHT: f32 = -0.5;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("could not read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path}: {source}")]
    Undecodable {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Tunables for the normalization steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub sharpen_factor: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            sharpen_factor: DEFAULT_SHARPEN_FACTOR,
            clahe_clip_limit: DEFAULT_CLAHE_CLIP_LIMIT,
            clahe_tiles: DEFAULT_CLAHE_TILES,
        }
    }
}

/// The two composite normalization pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessStrategy {
    /// Strategy A: sharpen, then CLAHE.
    SharpenEqualize,
    /// Strategy B: grayscale denoise + unsharp mask, then CLAHE.
    DenoiseEqualize,
}

impl PreprocessStrategy {
    pub fn apply(&self, image: &RgbImage, config: &PreprocessConfig) -> RgbImage {
        let enhanced = match self {
            PreprocessStrategy::SharpenEqualize => sharpen(image, config.sharpen_factor),
            PreprocessStrategy::DenoiseEqualize => denoise_and_sharpen(image),
        };
        equalize_contrast(&enhanced, config.clahe_clip_limit, config.clahe_tiles)
    }
}

/// Read and decode an image file into 8-bit RGB.
///
/// The format is sniffed from the content, not the extension.
pub fn load_image(path: &Path) -> Result<RgbImage, DecodeError> {
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let decoded = image::load_from_memory(&bytes).map_err(|source| DecodeError::Undecodable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.to_rgb8())
}

/// BT.601 luminance plane (row-major, one byte per pixel).
pub fn luminance(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|Rgb([r, g, b])| {
            (0.299 * *r as f32 + 0.587 * *g as f32 + 0.114 * *b as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Replicate a luminance plane into three identical channels.
pub fn gray_to_rgb(gray: &[u8], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = gray[(y * width + x) as usize];
        Rgb([v, v, v])
    })
}

/// Sharpness enhancement: blend the image away from a smoothed copy.
///
/// `factor` 1.0 returns the input unchanged, 0.0 returns the smoothed copy,
/// values above 1.0 sharpen. Border pixels are never smoothed.
pub fn sharpen(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return image.clone();
    }

    let mut output = image.clone();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut pixel = [0u8; 3];
            for (c, out) in pixel.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for dy in 0..3 {
                    for dx in 0..3 {
                        let v = image.get_pixel(x + dx - 1, y + dy - 1)[c] as f32;
                        sum += if dx == 1 && dy == 1 { v * SMOOTH_CENTER_WEIGHT } else { v };
                    }
                }
                // The smoothed copy is an 8-bit image; the blend truncates.
                let smoothed = (sum / SMOOTH_KERNEL_SUM).round();
                let original = image.get_pixel(x, y)[c] as f32;
                *out = (smoothed + factor * (original - smoothed)).clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(x, y, Rgb(pixel));
        }
    }
    output
}

/// Grayscale CLAHE, expanded back to three channels.
pub fn equalize_contrast(image: &RgbImage, clip_limit: f32, tiles: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut gray = luminance(image);
    clahe_enhance(&mut gray, width, height, tiles, clip_limit);
    gray_to_rgb(&gray, width, height)
}

/// Grayscale, 3x3 Gaussian denoise, then unsharp mask `1.5*gray - 0.5*blur`.
pub fn denoise_and_sharpen(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let gray = luminance(image);
    let blurred = gaussian_blur_3x3(&gray, width as usize, height as usize);

    let sharpened: Vec<u8> = gray
        .iter()
        .zip(blurred.iter())
        .map(|(&g, &b)| {
            (UNSHARP_ORIGINAL_WEIGHT * g as f32 + UNSHARP_BLUR_WEIGHT * b as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        })
        .collect();

    gray_to_rgb(&sharpened, width, height)
}

/// Separable [1, 2, 1] / 4 blur with mirrored borders (edge pixel not repeated).
fn gaussian_blur_3x3(gray: &[u8], width: usize, height: usize) -> Vec<u8> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let mut horizontal = vec![0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let left = gray[y * width + reflect(x as isize - 1, width)] as f32;
            let right = gray[y * width + reflect(x as isize + 1, width)] as f32;
            let center = gray[y * width + x] as f32;
            horizontal[y * width + x] = 0.25 * left + 0.5 * center + 0.25 * right;
        }
    }

    let mut output = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let up = horizontal[reflect(y as isize - 1, height) * width + x];
            let down = horizontal[reflect(y as isize + 1, height) * width + x];
            let center = horizontal[y * width + x];
            output[y * width + x] = (0.25 * up + 0.5 * center + 0.25 * down)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }
    output
}

fn reflect(i: isize, len: usize) -> usize {
    let last = len as isize - 1;
    if last == 0 {
        return 0;
    }
    if i < 0 {
        (-i).min(last) as usize
    } else if i > last {
        (2 * last - i).max(0) as usize
    } else {
        i as usize
    }
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// The image is split into a `tiles`×`tiles` grid. Each tile histogram is
/// clipped at `clip_limit` times the mean bin height, the excess is spread
/// evenly over all bins (the remainder strided across the range), and pixels
/// are remapped by bilinear interpolation between the four nearest tile
/// lookup tables, anchored at tile centres. When a dimension is not a
/// multiple of `tiles`, the grid covers a mirror-padded image so edge pixels
/// still contribute to a histogram. Images with fewer pixels than tiles
/// along either axis are left untouched.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
        return;
    }

    if w < t || h < t {
        return;
    }

    let tile_w = w.div_ceil(t);
    let tile_h = h.div_ceil(t);
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
    let lut_scale = 255.0 / tile_pixels as f32;

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(t * t);

    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                let row_start = reflect(y as isize, h) * w;
                for x in x0..x0 + tile_w {
                    hist[gray[row_start + reflect(x as isize, w)] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let residual = (excess % 256) as usize;
            hist.iter_mut().for_each(|bin| *bin += redist);
            if residual > 0 {
                let step = (256 / residual).max(1);
                for bin in hist.iter_mut().step_by(step).take(residual) {
                    *bin += 1;
                }
            }

            let mut lut = [0u8; 256];
            let mut cumulative = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                cumulative += count;
                lut[i] = (cumulative as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[y * w + x] as usize;
            let tl = luts[r0 * t + c0][pixel] as f32;
            let tr = luts[r0 * t + c1][pixel] as f32;
            let bl = luts[r1 * t + c0][pixel] as f32;
            let br = luts[r1 * t + c1][pixel] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
