pub mod aspect;
pub mod estimator;
pub mod homography;
pub mod lens;
pub mod markers;

pub use estimator::{Decision, HomographyEstimator, HomographyState, ReuseReason, MOTION_THRESHOLD};
pub use homography::Homography;
pub use lens::LensModel;
pub use markers::{MarkerSet, Quad};
