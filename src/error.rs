//! Error kinds shared by the geometry engine and the pipeline stages

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RectifyError {
    /// Two adjacent outer corners are too close for the surface geometry to be defined.
    /// Recoverable: the estimator keeps its previous transform.
    #[error("marker corners {first} and {second} are {distance:.3}px apart, geometry undefined")]
    DetectionDegenerate {
        first: usize,
        second: usize,
        distance: f64,
    },

    /// Conversion or output allocation failed. Fatal to the owning stage.
    #[error("frame allocation failed: {0}")]
    AllocationFailure(String),

    /// The producer behind an observed buffer is gone. Graceful end of stream.
    #[error("upstream producer has terminated")]
    UpstreamClosed,

    #[error("{0}")]
    Fatal(String),
}

impl RectifyError {
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::AllocationFailure(msg.into())
    }

    /// Per-frame conditions the estimator absorbs by keeping its transform
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DetectionDegenerate { .. })
    }
}
