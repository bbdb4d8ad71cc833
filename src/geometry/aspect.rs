//! True aspect ratio of a rectangle seen under perspective, and the centered
//! rectangle it is rectified onto.
//!
//! The projective estimate follows the two-vanishing-point construction used
//! for whiteboard scanning: the image quadrilateral fixes the vanishing
//! directions of both side pairs, which together with the principal point
//! (taken as the image center) determine the focal length and from it the
//! ratio of the physical side lengths.

use nalgebra::{Point2, Vector3};
use tracing::trace;

use super::markers::Quad;
use crate::error::RectifyError;

/// Closer than this, two corners are treated as the same point
pub const MIN_CORNER_DISTANCE: f64 = 1.0;

/// Cross-ratio coefficients this close to one mean the opposite sides are
/// practically parallel and foreshortening carries no information
pub const PARALLEL_EPSILON: f64 = 1e-8;

/// Estimate width / height of the physical rectangle imaged as `quad`
/// (ordered TL, TR, BR, BL) in an image of the given size.
pub fn estimate_aspect_ratio(
    quad: &Quad,
    image_width: u32,
    image_height: u32,
) -> Result<f64, RectifyError> {
    check_corner_spacing(quad)?;

    let u0 = image_width as f64 / 2.0;
    let v0 = image_height as f64 / 2.0;

    let m1 = homogeneous(quad[0]);
    let m2 = homogeneous(quad[1]);
    let m3 = homogeneous(quad[3]);
    let m4 = homogeneous(quad[2]);

    let k2 = m1.cross(&m4).dot(&m3) / m2.cross(&m4).dot(&m3);
    let k3 = m1.cross(&m4).dot(&m2) / m3.cross(&m4).dot(&m2);

    if !k2.is_finite() || !k3.is_finite() {
        trace!("Collinear corners, using side lengths");
        return Ok(side_length_ratio(quad));
    }
    if (k2 - 1.0).abs() < PARALLEL_EPSILON || (k3 - 1.0).abs() < PARALLEL_EPSILON {
        return Ok(side_length_ratio(quad));
    }

    let n2 = m2 * k2 - m1;
    let n3 = m3 * k3 - m1;

    let f_squared = -((n2.x * n3.x - (n2.x * n3.z + n2.z * n3.x) * u0 + n2.z * n3.z * u0 * u0)
        + (n2.y * n3.y - (n2.y * n3.z + n2.z * n3.y) * v0 + n2.z * n3.z * v0 * v0))
        / (n2.z * n3.z);
    let f = f_squared.abs().sqrt();

    if !f.is_finite() || f < f64::EPSILON {
        return Ok(side_length_ratio(quad));
    }

    // |A^-1 n|^2 with A the intrinsic matrix of focal f and principal point (u0, v0)
    let norm = |n: &Vector3<f64>| {
        let x = (n.x - u0 * n.z) / f;
        let y = (n.y - v0 * n.z) / f;
        x * x + y * y + n.z * n.z
    };

    let ratio = (norm(&n2) / norm(&n3)).sqrt();
    if ratio.is_finite() && ratio > 0.0 {
        trace!(k2, k3, f, ratio, "Projective aspect ratio");
        Ok(ratio)
    } else {
        Ok(side_length_ratio(quad))
    }
}

/// Centered rectangle with the given aspect ratio inside a `width` x `height`
/// frame: full width with bars above and below when the surface is wider than
/// the frame, full height with bars left and right otherwise.
pub fn target_rect(aspect: f64, width: u32, height: u32) -> Quad {
    let w = width as f64;
    let h = height as f64;

    let (rect_w, rect_h) = if aspect > w / h {
        (w, w / aspect)
    } else {
        (h * aspect, h)
    };

    let x0 = (w - rect_w) / 2.0;
    let y0 = (h - rect_h) / 2.0;
    [
        Point2::new(x0, y0),
        Point2::new(x0 + rect_w, y0),
        Point2::new(x0 + rect_w, y0 + rect_h),
        Point2::new(x0, y0 + rect_h),
    ]
}

fn check_corner_spacing(quad: &Quad) -> Result<(), RectifyError> {
    for first in 0..4 {
        let second = (first + 1) % 4;
        let distance = nalgebra::distance(&quad[first], &quad[second]);
        if distance.is_nan() || distance < MIN_CORNER_DISTANCE {
            return Err(RectifyError::DetectionDegenerate {
                first,
                second,
                distance,
            });
        }
    }
    Ok(())
}

/// Mean width over mean height, ignoring perspective
fn side_length_ratio(quad: &Quad) -> f64 {
    let top = nalgebra::distance(&quad[0], &quad[1]);
    let bottom = nalgebra::distance(&quad[3], &quad[2]);
    let left = nalgebra::distance(&quad[0], &quad[3]);
    let right = nalgebra::distance(&quad[1], &quad[2]);
    (top + bottom) / (left + right)
}

fn homogeneous(p: Point2<f64>) -> Vector3<f64> {
    Vector3::new(p.x, p.y, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quad(points: [(f64, f64); 4]) -> Quad {
        points.map(|(x, y)| Point2::new(x, y))
    }

    #[test]
    fn fronto_parallel_rectangle() {
        let q = quad([(100.0, 100.0), (500.0, 100.0), (500.0, 400.0), (100.0, 400.0)]);
        let ar = estimate_aspect_ratio(&q, 640, 480).unwrap();
        assert_abs_diff_eq!(ar, 400.0 / 300.0, epsilon = 1e-3);
    }

    #[test]
    fn tilted_two_to_one_rectangle() {
        // 2 x 1 rectangle rotated about both axes, focal length 700, center (320, 240)
        let q = quad([
            (173.1605042489629, 132.5984377985024),
            (529.0899820422519, 161.6510265879061),
            (508.33201631364415, 333.7989655201547),
            (185.96177051787325, 286.29935640276005),
        ]);
        let ar = estimate_aspect_ratio(&q, 640, 480).unwrap();
        assert_abs_diff_eq!(ar, 2.0, epsilon = 1e-3);

        // Side lengths alone are visibly off for this view
        assert!((side_length_ratio(&q) - 2.0).abs() > 0.05);
    }

    #[test]
    fn coincident_corners_are_degenerate() {
        let q = quad([(100.0, 100.0), (100.5, 100.0), (500.0, 400.0), (100.0, 400.0)]);
        match estimate_aspect_ratio(&q, 640, 480) {
            Err(RectifyError::DetectionDegenerate {
                first,
                second,
                distance,
            }) => {
                assert_eq!((first, second), (0, 1));
                assert!(distance < 1.0);
            }
            other => panic!("expected degenerate corners, got {other:?}"),
        }
    }

    #[test]
    fn wrap_around_edge_is_checked() {
        let q = quad([(100.0, 100.0), (500.0, 100.0), (500.0, 400.0), (100.0, 100.2)]);
        assert!(matches!(
            estimate_aspect_ratio(&q, 640, 480),
            Err(RectifyError::DetectionDegenerate {
                first: 3,
                second: 0,
                ..
            })
        ));
    }

    #[test]
    fn nan_corners_are_degenerate() {
        let q = quad([(f64::NAN, 0.0), (500.0, 100.0), (500.0, 400.0), (100.0, 400.0)]);
        assert!(estimate_aspect_ratio(&q, 640, 480).is_err());
    }

    #[test]
    fn parallelogram_falls_back_to_side_lengths() {
        // Both side pairs parallel: no vanishing points
        let q = quad([(100.0, 100.0), (400.0, 100.0), (450.0, 300.0), (150.0, 300.0)]);
        let ar = estimate_aspect_ratio(&q, 640, 480).unwrap();
        assert!(ar.is_finite());
        assert_abs_diff_eq!(ar, side_length_ratio(&q), epsilon = 1e-9);
    }

    #[test]
    fn wide_surface_gets_bars_above_and_below() {
        let rect = target_rect(2.0, 640, 480);
        assert_abs_diff_eq!(rect[0].x, 0.0);
        assert_abs_diff_eq!(rect[0].y, 80.0);
        assert_abs_diff_eq!(rect[2].x, 640.0);
        assert_abs_diff_eq!(rect[2].y, 400.0);
    }

    #[test]
    fn tall_surface_gets_bars_left_and_right() {
        let rect = target_rect(1.0, 640, 480);
        assert_abs_diff_eq!(rect[0].x, 80.0);
        assert_abs_diff_eq!(rect[0].y, 0.0);
        assert_abs_diff_eq!(rect[2].x, 560.0);
        assert_abs_diff_eq!(rect[2].y, 480.0);
        let w = rect[1].x - rect[0].x;
        let h = rect[3].y - rect[0].y;
        assert_abs_diff_eq!(w / h, 1.0, epsilon = 1e-12);
    }
}
