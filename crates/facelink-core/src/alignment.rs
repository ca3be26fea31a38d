//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the canonical five-point layout used by
//! recognition models. The reference points are defined for a 112×112 crop
//! and scaled for other input sizes.

use image::{Rgb, RgbImage};

/// Canonical landmark positions for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// Reference landmarks scaled to a square crop of `size` pixels.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let s = size as f32 / REFERENCE_SIZE;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// Least-squares similarity transform mapping `src` points onto `dst`.
///
/// Returns `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for the 10×4 system in [a, b, tx, ty]
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb).map(|v| v as f32);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. A singular system yields the
/// identity transform.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(a: [[f64; 4]; 4], b: [f64; 4]) -> [f64; 4] {
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let mut acc = m[i][4];
        for j in (i + 1)..4 {
            acc -= m[i][j] * x[j];
        }
        x[i] = acc / m[i][i];
    }
    x
}

/// Inverse-map every output pixel through `matrix` with bilinear sampling.
/// Samples outside the source are black.
fn warp_affine(src: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    let (w, h) = (src.width() as i64, src.height() as i64);
    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = src.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Align a face to a `size`×`size` crop given its five detected landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    warp_affine(image, &matrix, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_half_scale_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
    }

    #[test]
    fn test_reference_landmarks_scale_with_size() {
        let r160 = reference_landmarks(160);
        let r112 = reference_landmarks(112);
        assert_eq!(r112, REFERENCE_LANDMARKS_112);
        assert!((r160[2].0 - 56.0252 * 160.0 / 112.0).abs() < 1e-3);
    }

    #[test]
    fn test_align_output_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 64, 32]));
        assert_eq!(align_face(&img, &REFERENCE_LANDMARKS_112, 112).dimensions(), (112, 112));
        assert_eq!(align_face(&img, &REFERENCE_LANDMARKS_112, 160).dimensions(), (160, 160));
    }

    #[test]
    fn test_bright_patch_lands_on_reference_eye() {
        let mut img = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                img.put_pixel(x, y, Rgb([255, 0, 255]));
            }
        }

        let aligned = align_face(&img, &src, 112);
        let (rx, ry) = (38u32, 52u32);
        let mut max_red = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                max_red = max_red.max(aligned.get_pixel(x, y).0[0]);
            }
        }
        assert!(max_red > 100, "expected bright patch near ({rx}, {ry}), max={max_red}");
        assert_eq!(aligned.get_pixel(rx, ry).0[1], 0);
    }
}
