//! Sliding-window patch inference over a whole volume.
//!
//! A volume is padded up to the patch size, covered by a [`PatchPlan`], scored
//! patch by patch through a [`PatchInference`] model, and the overlapping
//! responses are averaged into a single label volume.

use std::time::Instant;

use ndarray::{s, Array4, ArrayD, Axis, Ix4};
use tracing::{debug, trace};

use crate::config::WindowConfig;
use crate::crash;
use crate::error::SegmentationError;
use crate::inference::{HeadLayout, PatchInference, PatchResponse};
use crate::padding::pad_to_patch;
use crate::planner::{validate_window, PatchPlan};
use crate::resolve::resolve;
use crate::volume::{shape3, LabelVolume, ScoreVolume, Shape3, VisitCounts, Volume};

/// Summed class scores and per-voxel visit counts for one padded volume.
#[derive(Debug, Clone)]
pub struct ScoreAccumulator {
    pub scores: ScoreVolume,
    pub visits: VisitCounts,
}

impl ScoreAccumulator {
    pub fn zeros(num_classes: usize, shape: Shape3) -> Self {
        let [w, h, d] = shape;
        Self {
            scores: ScoreVolume::zeros((num_classes, w, h, d)),
            visits: VisitCounts::zeros(shape),
        }
    }

    fn add_patch(&mut self, origin: Shape3, patch_size: Shape3, response: &Array4<f32>) {
        let [x, y, z] = origin;
        let [px, py, pz] = patch_size;
        let mut scores = self
            .scores
            .slice_mut(s![.., x..x + px, y..y + py, z..z + pz]);
        scores += response;
        let mut visits = self.visits.slice_mut(s![x..x + px, y..y + py, z..z + pz]);
        visits += 1;
    }
}

/// Output of [`SlidingWindowEngine::segment`], cropped back to the input shape.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub labels: LabelVolume,
    /// Visit-normalized class scores.
    pub scores: ScoreVolume,
    pub patches: usize,
}

#[derive(Debug, Clone)]
pub struct SlidingWindowEngine {
    window: WindowConfig,
    num_classes: usize,
    head: HeadLayout,
}

impl SlidingWindowEngine {
    pub fn new(
        window: WindowConfig,
        num_classes: usize,
        head: HeadLayout,
    ) -> Result<Self, SegmentationError> {
        validate_window(window.patch_size, window.stride_xy, window.stride_z)?;
        if num_classes == 0 {
            return Err(SegmentationError::InvalidWindow(
                "num_classes must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            window,
            num_classes,
            head,
        })
    }

    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn head(&self) -> HeadLayout {
        self.head
    }

    pub fn plan(&self, padded_shape: Shape3) -> Result<PatchPlan, SegmentationError> {
        PatchPlan::new(
            padded_shape,
            self.window.patch_size,
            self.window.stride_xy,
            self.window.stride_z,
        )
    }

    /// Score every planned patch of an already padded volume.
    ///
    /// Patches are inferred one at a time in plan order; the first failing
    /// patch aborts the volume and nothing accumulated so far is returned.
    pub fn accumulate(
        &self,
        padded: &Volume,
        plan: &PatchPlan,
        model: &mut dyn PatchInference,
    ) -> Result<ScoreAccumulator, SegmentationError> {
        let padded_shape = shape3(padded);
        let patch_size = plan.patch_size;
        let [px, py, pz] = patch_size;
        let mut accumulator = ScoreAccumulator::zeros(self.num_classes, padded_shape);

        let total = plan.len();
        for (index, origin) in plan.origins().enumerate() {
            let [x, y, z] = origin;
            if x + px > padded_shape[0] || y + py > padded_shape[1] || z + pz > padded_shape[2] {
                return Err(SegmentationError::ShapeMismatch(format!(
                    "patch at {origin:?} with size {patch_size:?} exceeds volume {padded_shape:?}"
                )));
            }

            let window = padded.slice(s![x..x + px, y..y + py, z..z + pz]);
            let patch = window
                .as_standard_layout()
                .into_owned()
                .insert_axis(Axis(0))
                .insert_axis(Axis(0));

            trace!(?origin, index = index + 1, total, "Inferring patch");
            crash::mark_patch(origin, index + 1, total);
            let response = model
                .infer(patch.view())
                .map_err(|error| SegmentationError::inference(origin, error))?;
            let scores = self.class_scores(response, origin)?;
            accumulator.add_patch(origin, patch_size, &scores);
        }

        Ok(accumulator)
    }

    /// Run the full pipeline on one volume: pad, plan, accumulate, resolve,
    /// crop.
    pub fn segment(
        &self,
        volume: Volume,
        model: &mut dyn PatchInference,
    ) -> Result<Segmentation, SegmentationError> {
        let started = Instant::now();
        let (padded, padding) = pad_to_patch(volume, self.window.patch_size);
        let plan = self.plan(shape3(&padded))?;

        debug!(
            original_shape = ?padding.original_shape,
            padded_shape = ?shape3(&padded),
            patches = plan.len(),
            origins_per_axis = ?[plan.x.len(), plan.y.len(), plan.z.len()],
            head = %self.head,
            "Starting sliding-window inference"
        );

        let accumulator = self.accumulate(&padded, &plan, model)?;
        let (labels, scores) = resolve(accumulator)?;

        debug!(
            patches = plan.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Sliding-window inference finished"
        );

        Ok(Segmentation {
            labels: padding.crop_spatial(labels),
            scores: padding.crop_scores(scores),
            patches: plan.len(),
        })
    }

    /// Pick the class-score tensor out of a response and check its shape.
    fn class_scores(
        &self,
        response: PatchResponse,
        origin: Shape3,
    ) -> Result<Array4<f32>, SegmentationError> {
        let scores = match (self.head, response) {
            (HeadLayout::Single, PatchResponse::Scores(scores)) => scores,
            (HeadLayout::WithAuxiliary, PatchResponse::WithAuxiliary { scores, .. }) => scores,
            (HeadLayout::Single, PatchResponse::WithAuxiliary { .. }) => {
                return Err(SegmentationError::ShapeMismatch(format!(
                    "patch {origin:?}: model returned auxiliary outputs but no auxiliary head is configured"
                )));
            }
            (HeadLayout::WithAuxiliary, PatchResponse::Scores(_)) => {
                return Err(SegmentationError::ShapeMismatch(format!(
                    "patch {origin:?}: auxiliary head configured but model returned class scores only"
                )));
            }
        };
        self.check_score_shape(scores, origin)
    }

    fn check_score_shape(
        &self,
        scores: ArrayD<f32>,
        origin: Shape3,
    ) -> Result<Array4<f32>, SegmentationError> {
        let scores = if scores.ndim() == 5 && scores.shape()[0] == 1 {
            scores.index_axis_move(Axis(0), 0)
        } else {
            scores
        };

        let [px, py, pz] = self.window.patch_size;
        let expected = [self.num_classes, px, py, pz];
        if scores.shape() != expected {
            return Err(SegmentationError::ShapeMismatch(format!(
                "patch {origin:?}: expected class scores {expected:?}, got {:?}",
                scores.shape()
            )));
        }

        scores.into_dimensionality::<Ix4>().map_err(|error| {
            SegmentationError::ShapeMismatch(format!("patch {origin:?}: {error}"))
        })
    }
}
