//! Face crops for the encoder.
//!
//! Faces with landmarks (accurate tier) are aligned to the canonical ArcFace
//! 112×112 layout with a least-squares similarity transform. Faces without
//! landmarks (fast tier) are cut out as a padded square around the box.

use crate::types::BoundingBox;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Extra context around a landmark-less box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.1;

/// 2×3 similarity transform `[a, -b, tx, b, a, ty]` mapping source to destination.
type Similarity = [f32; 6];

/// Closed-form least-squares 4-DOF similarity (scale, rotation, translation).
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let (msx, msy) = centroid(src);
    let (mdx, mdy) = centroid(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - msx, sy - msy);
        let (dx, dy) = (dx - mdx, dy - mdy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    if norm < 1e-12 {
        // Degenerate landmarks: pure translation onto the reference centroid.
        return [1.0, 0.0, mdx - msx, 0.0, 1.0, mdy - msy];
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);
    [a, -b, tx, b, a, ty]
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Bilinear RGB sample; out-of-bounds neighbours read as black.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let fetch = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
            let Rgb([r, g, b]) = *image.get_pixel(x as u32, y as u32);
            [r as f32, g as f32, b as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `image` through the inverse of `m` into an `out_size`² crop.
fn warp_similarity(image: &RgbImage, m: &Similarity, out_size: u32) -> RgbImage {
    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        sample_bilinear(image, ia * dx + ib * dy, -ib * dx + ia * dy)
    })
}

/// Align a face to the canonical 112×112 crop from its five landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let m = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_similarity(image, &m, ALIGNED_SIZE)
}

/// Square crop centred on the box, padded by [`CROP_MARGIN`], resized to 112×112.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    if side <= 0.0 {
        return RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    }
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let left = cx - side / 2.0;
    let top = cy - side / 2.0;
    let step = side / ALIGNED_SIZE as f32;

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let sx = left + (ox as f32 + 0.5) * step - 0.5;
        let sy = top + (oy as f32 + 0.5) * step - 0.5;
        sample_bilinear(image, sx, sy)
    })
}

/// Pick the crop method the detector output allows.
pub fn face_crop(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    match &face.landmarks {
        Some(landmarks) => align_face(image, landmarks),
        None => crop_face(image, face),
    }
}
