//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! InsightFace reference landmarks and least-squares estimation.

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const ALIGNED_SIZE: usize = 112;

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4]; // 4x1

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        // Row 1: [sx, -sy, 1, 0] * [a, b, tx, ty]^T = dx
        let r1 = [sx, -sy, 1.0, 0.0];
        // Row 2: [sy, sx, 0, 1] * [a, b, tx, ty]^T = dy
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    // Solve 4x4 system via Gaussian elimination with partial pivoting
    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    // Forward elimination with partial pivoting
    for col in 0..4 {
        // Find pivot
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // fallback: identity-ish
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    // Back substitution
    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Apply a 2×3 similarity warp `[a, -b, tx, b, a, ty]` to produce an
/// `out_width` × `out_height` image.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with `fill`.
fn warp_affine(
    frame: &[u8],
    src_width: usize,
    src_height: usize,
    matrix: &[f32; 6],
    out_width: usize,
    out_height: usize,
    fill: u8,
) -> Vec<u8> {
    let (a, _neg_b, tx) = (matrix[0], matrix[1], matrix[2]);
    let (b, _a2, ty) = (matrix[3], matrix[4], matrix[5]);

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![fill; out_width * out_height];
    }
    let inv_det = 1.0 / det;
    let ia = a * inv_det;
    let ib = b * inv_det;

    let mut output = vec![fill; out_width * out_height];

    for oy in 0..out_height {
        for ox in 0..out_width {
            // src = M_inv * (dst - t)
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let x1 = x0 + 1;
            let y1 = y0 + 1;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i32, y: i32| -> f32 {
                if x >= 0 && x < src_width as i32 && y >= 0 && y < src_height as i32 {
                    frame[y as usize * src_width + x as usize] as f32
                } else {
                    fill as f32
                }
            };

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x1, y0) * fx * (1.0 - fy)
                + sample(x0, y1) * (1.0 - fx) * fy
                + sample(x1, y1) * fx * fy;

            output[oy * out_width + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

/// Align a detected face to a canonical 112×112 crop.
///
/// Takes a grayscale frame and five detected facial landmarks, computes the
/// similarity transform to reference positions, and warps the face region
/// into a 112×112 aligned output suitable for ArcFace embedding extraction.
pub fn align_face(
    frame: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
) -> Vec<u8> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(
        frame,
        width as usize,
        height as usize,
        &matrix,
        ALIGNED_SIZE,
        ALIGNED_SIZE,
        0,
    )
}

/// Rotate a grayscale image by `angle_deg` (counter-clockwise) about its center,
/// keeping the original dimensions. Corners exposed by the rotation are black.
pub fn rotate_about_center(frame: &[u8], width: u32, height: u32, angle_deg: f32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if frame.len() < w * h {
        return vec![0u8; w * h];
    }
    let theta = -angle_deg.to_radians();
    let (a, b) = (theta.cos(), theta.sin());
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    // dst = R * (src - c) + c
    let tx = cx - (a * cx - b * cy);
    let ty = cy - (b * cx + a * cy);
    warp_affine(frame, w, h, &[a, -b, tx, b, a, ty], w, h, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &[f32; 6], (x, y): (f32, f32)) -> (f32, f32) {
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    #[test]
    fn test_similarity_transform_recovers_known_mapping() {
        let same = estimate_similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        for (got, want) in same.iter().zip([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]) {
            assert!((got - want).abs() < 1e-3, "{same:?}");
        }

        // Reference points scaled by 3 and shifted by (50, 20).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 3.0 + 50.0, y * 3.0 + 20.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112) {
            let (x, y) = apply(&m, *s);
            assert!((x - d.0).abs() < 0.05 && (y - d.1).abs() < 0.05, "{s:?} -> ({x}, {y})");
        }
    }

    #[test]
    fn test_align_face_moves_eye_to_reference() {
        let (w, h) = (160usize, 160usize);
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 1.25 + 10.0, y * 1.25 + 5.0));
        let mut frame = vec![0u8; w * h];
        let (ex, ey) = (src[1].0.round() as usize, src[1].1.round() as usize);
        for y in ey - 3..=ey + 3 {
            for x in ex - 3..=ex + 3 {
                frame[y * w + x] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[1].0.round() as usize,
            REFERENCE_LANDMARKS_112[1].1.round() as usize,
        );
        assert!(aligned[ry * ALIGNED_SIZE + rx] > 200);
        assert_eq!(aligned[5 * ALIGNED_SIZE + 5], 0);
    }

    #[test]
    fn test_warp_fills_outside_source() {
        let frame = vec![90u8; 20 * 10];
        let shift = [1.0, 0.0, 15.0, 0.0, 1.0, 0.0];
        let out = warp_affine(&frame, 20, 10, &shift, 20, 10, 7);
        assert_eq!(out.len(), 200);
        assert_eq!(out[0], 7, "dst x=0 maps outside the source");
        assert_eq!(out[19], 90);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let frame: Vec<u8> = (0..64u32 * 48).map(|i| (i % 251) as u8).collect();
        let rotated = rotate_about_center(&frame, 64, 48, 0.0);
        assert_eq!(rotated, frame);
    }

    #[test]
    fn test_rotate_keeps_center_and_size() {
        let w = 41usize;
        let h = 41usize;
        let mut frame = vec![0u8; w * h];
        for dy in 0..3 {
            for dx in 0..3 {
                frame[(19 + dy) * w + 19 + dx] = 200;
            }
        }
        let rotated = rotate_about_center(&frame, w as u32, h as u32, 10.0);
        assert_eq!(rotated.len(), w * h);
        assert!(rotated[20 * w + 20] > 150, "center pixel should survive rotation");
    }

    #[test]
    fn test_rotate_moves_off_center_point() {
        // A bright patch right of center moves up under a counter-clockwise turn.
        let w = 101usize;
        let h = 101usize;
        let mut frame = vec![0u8; w * h];
        for dy in 0..5 {
            for dx in 0..5 {
                frame[(48 + dy) * w + 88 + dx] = 255;
            }
        }
        let rotated = rotate_about_center(&frame, w as u32, h as u32, 90.0);
        // (90, 50) rotates to roughly (50, 10).
        let mut max_val = 0u8;
        for y in 8..13 {
            for x in 48..53 {
                max_val = max_val.max(rotated[y * w + x]);
            }
        }
        assert!(max_val > 100, "patch not found near (50, 10), max={max_val}");
    }
}
