//! Pinhole intrinsics with radial-tangential distortion

use nalgebra::Point2;

/// Brown-Conrady lens: `k1, k2, k3` radial and `p1, p2` tangential terms
/// around a pinhole with focal lengths `fx, fy` and principal point `cx, cy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

const UNDISTORT_ITERATIONS: usize = 20;

impl LensModel {
    /// From a row-major 3x3 camera matrix and `k1, k2, p1, p2[, k3]`.
    /// `None` when the focal lengths are zero or fewer than four
    /// coefficients are given.
    pub fn from_calibration(camera_matrix: &[[f64; 3]; 3], distortion: &[f64]) -> Option<Self> {
        let (fx, fy) = (camera_matrix[0][0], camera_matrix[1][1]);
        if distortion.len() < 4 || fx == 0.0 || fy == 0.0 {
            return None;
        }
        Some(Self {
            fx,
            fy,
            cx: camera_matrix[0][2],
            cy: camera_matrix[1][2],
            k1: distortion[0],
            k2: distortion[1],
            p1: distortion[2],
            p2: distortion[3],
            k3: distortion.get(4).copied().unwrap_or(0.0),
        })
    }

    /// Normalized-plane offset added by the lens at undistorted `(x, y)`
    fn displacement(&self, x: f64, y: f64) -> (f64, f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (radial, dx, dy)
    }

    /// Ideal pixel position to where the lens actually images it
    pub fn distort(&self, p: Point2<f64>) -> Point2<f64> {
        let x = (p.x - self.cx) / self.fx;
        let y = (p.y - self.cy) / self.fy;
        let (radial, dx, dy) = self.displacement(x, y);
        Point2::new(
            self.fx * (x * radial + dx) + self.cx,
            self.fy * (y * radial + dy) + self.cy,
        )
    }

    /// Inverse of [`distort`](Self::distort) by fixed-point iteration
    pub fn undistort(&self, p: Point2<f64>) -> Point2<f64> {
        let xd = (p.x - self.cx) / self.fx;
        let yd = (p.y - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let (radial, dx, dy) = self.displacement(x, y);
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Point2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    pub(crate) fn barrel() -> LensModel {
        LensModel::from_calibration(
            &[[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]],
            &[-0.1, 0.01, 0.001, -0.0005],
        )
        .unwrap()
    }

    #[test]
    fn undistort_inverts_distort() {
        let lens = barrel();
        for p in [(40.0, 30.0), (280.0, 35.0), (600.0, 450.0), (320.0, 240.0)] {
            let p = Point2::new(p.0, p.1);
            let back = lens.distort(lens.undistort(p));
            assert_abs_diff_eq!(back.x, p.x, epsilon = 1e-6);
            assert_abs_diff_eq!(back.y, p.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn barrel_pulls_corners_outward_when_undistorted() {
        let p = barrel().undistort(Point2::new(40.0, 30.0));
        assert_abs_diff_eq!(p.x, 24.833, epsilon = 1e-3);
        assert_abs_diff_eq!(p.y, 18.229, epsilon = 1e-3);
    }

    #[test]
    fn principal_point_is_fixed() {
        let c = Point2::new(320.0, 240.0);
        assert_eq!(barrel().distort(c), c);
    }

    #[test]
    fn rejects_incomplete_models() {
        let k = [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]];
        assert!(LensModel::from_calibration(&k, &[-0.1, 0.01]).is_none());
        let zero = [[0.0; 3]; 3];
        assert!(LensModel::from_calibration(&zero, &[0.0; 5]).is_none());
    }
}
