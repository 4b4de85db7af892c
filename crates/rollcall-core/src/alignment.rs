//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the ArcFace reference layout and
//! warps the face into a 112×112 RGB crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 crop.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit from `src` to `dst`.
    ///
    /// Returns `None` when the source points are degenerate (all coincide).
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut var = 0.0f32;
        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            var += sx * sx + sy * sy;
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
        }
        if var < 1e-9 {
            return None;
        }

        let a = num_a / var;
        let b = num_b / var;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping, or `None` if the transform collapses the plane.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Bilinear warp of `src` through `transform` into a square crop.
/// Pixels that fall outside the source are black.
pub fn warp(src: &RgbImage, transform: &Similarity, out_size: u32) -> RgbImage {
    let Some(inv) = transform.inverse() else {
        return RgbImage::new(out_size, out_size);
    };
    let (w, h) = (src.width() as i64, src.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            src.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = inv.apply((ox as f32, oy as f32));
        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        Rgb(std::array::from_fn(|c| {
            let top = tl[c] * (1.0 - fx) + tr[c] * fx;
            let bot = bl[c] * (1.0 - fx) + br[c] * fx;
            (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Align a detected face to the canonical 112×112 ArcFace crop.
pub fn align_face(src: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(warp(src, &transform, ALIGNED_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3);
        assert!(t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_half_scale_fit() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_rotation_fit() {
        // 90° rotation about the origin
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!(t.a.abs() < 1e-4);
        assert!((t.b + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let src = [(5.0, 5.0); 5];
        assert!(Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).is_none());
        assert!(align_face(&RgbImage::new(200, 200), &src).is_none());
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -7.0 };
        let inv = t.inverse().unwrap();
        let p = (33.0, 71.0);
        let (x, y) = inv.apply(t.apply(p));
        assert!((x - p.0).abs() < 1e-3 && (y - p.1).abs() < 1e-3);
    }

    #[test]
    fn test_aligned_crop_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let out = align_face(&img, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(out.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut img = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // bright 5×5 patch on the left eye
        for dy in 0..5 {
            for dx in 0..5 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 200, 100]));
            }
        }

        let aligned = align_face(&img, &src).unwrap();
        let (rx, ry) = REFERENCE_LANDMARKS_112[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);

        let mut brightest = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                brightest = brightest.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(brightest > 100, "expected patch near ({rx}, {ry}), max={brightest}");
    }
}
