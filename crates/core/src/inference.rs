//! Contract between the sliding-window engine and the model that scores a patch.

use anyhow::Result;
use ndarray::{ArrayD, ArrayView5};

/// What a model hands back for one patch.
#[derive(Debug, Clone)]
pub enum PatchResponse {
    /// Class probabilities only.
    Scores(ArrayD<f32>),
    /// Class probabilities first, followed by extra heads the engine ignores
    /// (for example a distance-regression output).
    WithAuxiliary {
        scores: ArrayD<f32>,
        auxiliary: Vec<ArrayD<f32>>,
    },
}

/// Which response layout the configured model produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeadLayout {
    #[default]
    Single,
    WithAuxiliary,
}

impl HeadLayout {
    pub fn from_auxiliary_flag(auxiliary_head_present: bool) -> Self {
        if auxiliary_head_present {
            Self::WithAuxiliary
        } else {
            Self::Single
        }
    }
}

impl std::fmt::Display for HeadLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::WithAuxiliary => write!(f, "with-auxiliary"),
        }
    }
}

/// A model scoring one patch at a time.
///
/// The input is `[1, 1, px, py, pz]`. The class-score tensor in the response
/// must be `[num_classes, px, py, pz]` (a leading batch axis of 1 is accepted)
/// and already normalized across classes.
pub trait PatchInference {
    fn infer(&mut self, patch: ArrayView5<'_, f32>) -> Result<PatchResponse>;
}

impl<F> PatchInference for F
where
    F: FnMut(ArrayView5<'_, f32>) -> Result<PatchResponse>,
{
    fn infer(&mut self, patch: ArrayView5<'_, f32>) -> Result<PatchResponse> {
        self(patch)
    }
}
