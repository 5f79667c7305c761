use thiserror::Error;

use crate::volume::Shape3;

/// Failures raised by the sliding-window pipeline.
///
/// Only [`SegmentationError::InvariantViolation`] stops a whole evaluation run;
/// every other variant aborts the volume in flight.
#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("label volume has no foreground voxels")]
    EmptyForeground,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("inference failed for patch at origin {origin:?}")]
    InferenceFailure {
        origin: Shape3,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("invalid window configuration: {0}")]
    InvalidWindow(String),
}

impl SegmentationError {
    pub fn inference(origin: Shape3, error: anyhow::Error) -> Self {
        Self::InferenceFailure {
            origin,
            source: error.into(),
        }
    }

    /// Whether this failure indicates a systemic defect that must halt the run.
    pub fn halts_run(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
