//! Face normalization via an eye-anchored rotate/scale/translate transform.
//!
//! Rotates the face so the eye line is horizontal, scales it so the eyes sit
//! at fixed relative positions, and resamples a square crop with bicubic
//! interpolation.

use crate::types::{BoundingBox, Landmarks};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Relative (x, y) position of the left eye in the output crop.
const DESIRED_LEFT_EYE: (f64, f64) = (0.35, 0.35);
/// Relative x position of the right eye; mirrors the left eye.
const DESIRED_RIGHT_EYE_X: f64 = 1.0 - DESIRED_LEFT_EYE.0;

/// Scale bias tiers keyed on input image size. Empirical calibration.
const LARGE_IMAGE_MIN_SIDE: u32 = 1000;
const MEDIUM_IMAGE_MIN_SIDE: u32 = 300;
const LARGE_IMAGE_BIAS: f64 = 0.10;
const MEDIUM_IMAGE_BIAS: f64 = 0.20;
const SMALL_IMAGE_BIAS: f64 = 0.35;

/// Bicubic kernel parameter (matches the common A = -0.75 convolution kernel).
const CUBIC_A: f64 = -0.75;

#[derive(Error, Debug, PartialEq)]
pub enum AlignmentError {
    #[error("degenerate eye landmarks: left {left:?} and right {right:?} coincide")]
    DegenerateGeometry { left: (i32, i32), right: (i32, i32) },
    #[error("landmark coordinate is not finite")]
    NonFiniteLandmark,
    #[error("target face size must be non-zero")]
    ZeroTargetSize,
}

/// 2×3 row-major affine matrix `[a, b, c, d, e, f]`:
/// ```text
/// | a  b  c |
/// | d  e  f |
/// ```
pub type Affine = [f64; 6];

/// Normalize one detected face into a `target_size × target_size` RGB crop.
///
/// `bbox` defaults to the whole image. The transform itself is anchored on the
/// eyes only; the scale bias tier is picked from the full image dimensions.
pub fn normalize_face(
    image: &RgbImage,
    target_size: u32,
    bbox: Option<&BoundingBox>,
    landmarks: &Landmarks,
) -> Result<RgbImage, AlignmentError> {
    if target_size == 0 {
        return Err(AlignmentError::ZeroTargetSize);
    }
    let region = bbox
        .copied()
        .unwrap_or_else(|| BoundingBox::full_frame(image.width(), image.height()));

    let left = pixel_coords(landmarks.left_eye.x, landmarks.left_eye.y)?;
    let right = pixel_coords(landmarks.right_eye.x, landmarks.right_eye.y)?;

    let matrix = alignment_matrix(left, right, target_size, image.width(), image.height())?;
    tracing::trace!(
        ?region,
        ?left,
        ?right,
        angle = eye_angle(left, right),
        "normalizing face"
    );

    Ok(warp_affine_cubic(image, &matrix, target_size))
}

/// Truncate a landmark to integer pixel coordinates.
fn pixel_coords(x: f32, y: f32) -> Result<(i32, i32), AlignmentError> {
    if !x.is_finite() || !y.is_finite() {
        return Err(AlignmentError::NonFiniteLandmark);
    }
    Ok((x as i32, y as i32))
}

/// Angle of the eye line in degrees. Zero when the eyes are level.
pub fn eye_angle(left: (i32, i32), right: (i32, i32)) -> f64 {
    let dx = (right.0 - left.0) as f64;
    let dy = (right.1 - left.1) as f64;
    dy.atan2(dx).to_degrees()
}

/// Additive scale bias for an input image of the given size.
pub fn scale_bias(width: u32, height: u32) -> f64 {
    if width >= LARGE_IMAGE_MIN_SIDE || height >= LARGE_IMAGE_MIN_SIDE {
        LARGE_IMAGE_BIAS
    } else if width > MEDIUM_IMAGE_MIN_SIDE || height > MEDIUM_IMAGE_MIN_SIDE {
        MEDIUM_IMAGE_BIAS
    } else {
        SMALL_IMAGE_BIAS
    }
}

/// Build the affine matrix mapping source pixels into the aligned crop.
pub fn alignment_matrix(
    left: (i32, i32),
    right: (i32, i32),
    target_size: u32,
    image_width: u32,
    image_height: u32,
) -> Result<Affine, AlignmentError> {
    let dx = (right.0 - left.0) as f64;
    let dy = (right.1 - left.1) as f64;
    let dist = (dx * dx + dy * dy).sqrt();
    if dist == 0.0 {
        return Err(AlignmentError::DegenerateGeometry { left, right });
    }

    let size = target_size as f64;
    let desired_dist = (DESIRED_RIGHT_EYE_X - DESIRED_LEFT_EYE.0) * size;
    let scale = desired_dist / dist + scale_bias(image_width, image_height);

    // Integer midpoint with floor division.
    let pivot = (
        (left.0 + right.0).div_euclid(2) as f64,
        (left.1 + right.1).div_euclid(2) as f64,
    );

    let mut m = rotation_matrix(pivot, eye_angle(left, right), scale);
    m[2] += size * 0.5 - pivot.0;
    m[5] += size * DESIRED_LEFT_EYE.1 - pivot.1;
    Ok(m)
}

/// Rotate by `angle_deg` (counter-clockwise, image y down) and scale about `center`.
fn rotation_matrix(center: (f64, f64), angle_deg: f64, scale: f64) -> Affine {
    let theta = angle_deg.to_radians();
    let alpha = scale * theta.cos();
    let beta = scale * theta.sin();
    let (cx, cy) = center;
    [
        alpha,
        beta,
        (1.0 - alpha) * cx - beta * cy,
        -beta,
        alpha,
        beta * cx + (1.0 - alpha) * cy,
    ]
}

/// Apply an affine matrix to a point.
pub fn apply(m: &Affine, x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

fn invert(m: &Affine) -> Option<Affine> {
    let [a, b, c, d, e, f] = *m;
    let det = a * e - b * d;
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        e * inv,
        -b * inv,
        (b * f - e * c) * inv,
        -d * inv,
        a * inv,
        (d * c - a * f) * inv,
    ])
}

fn cubic_weights(t: f64) -> [f64; 4] {
    let w = |x: f64| {
        let x = x.abs();
        if x <= 1.0 {
            ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
        } else if x < 2.0 {
            ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
        } else {
            0.0
        }
    };
    [w(t + 1.0), w(t), w(1.0 - t), w(2.0 - t)]
}

/// Warp `src` into a square `out_size` image with bicubic interpolation.
///
/// Each output pixel is mapped back through the inverse transform. Samples
/// outside the source are black.
pub fn warp_affine_cubic(src: &RgbImage, m: &Affine, out_size: u32) -> RgbImage {
    let mut out = RgbImage::new(out_size, out_size);
    let Some(inv) = invert(m) else {
        return out;
    };

    let (w, h) = (src.width() as i64, src.height() as i64);
    let sample = |x: i64, y: i64| -> [f64; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let Rgb(p) = *src.get_pixel(x as u32, y as u32);
            [p[0] as f64, p[1] as f64, p[2] as f64]
        } else {
            [0.0; 3]
        }
    };

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = apply(&inv, ox as f64, oy as f64);
        let x0 = sx.floor();
        let y0 = sy.floor();
        let wx = cubic_weights(sx - x0);
        let wy = cubic_weights(sy - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);

        let mut acc = [0.0f64; 3];
        for (j, wyj) in wy.iter().enumerate() {
            for (i, wxi) in wx.iter().enumerate() {
                let weight = wxi * wyj;
                if weight == 0.0 {
                    continue;
                }
                let s = sample(x0 + i as i64 - 1, y0 + j as i64 - 1);
                for c in 0..3 {
                    acc[c] += s[c] * weight;
                }
            }
        }
        *pixel = Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8));
    }

    out
}
