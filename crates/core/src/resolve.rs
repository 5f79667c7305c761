use ndarray::{Axis, Zip};

use crate::engine::ScoreAccumulator;
use crate::error::SegmentationError;
use crate::volume::{LabelVolume, ScoreVolume};

/// Average accumulated scores by visit count and take the per-voxel arg-max.
///
/// Ties go to the lowest class index. A voxel that no patch visited means the
/// planner is broken, so it is reported as an invariant violation instead of
/// producing NaN scores.
pub fn resolve(
    accumulator: ScoreAccumulator,
) -> Result<(LabelVolume, ScoreVolume), SegmentationError> {
    let ScoreAccumulator {
        mut scores,
        visits,
    } = accumulator;

    let unvisited = visits.iter().filter(|&&count| count == 0).count();
    if unvisited > 0 {
        let first = visits
            .indexed_iter()
            .find(|(_, &count)| count == 0)
            .map(|(index, _)| index);
        return Err(SegmentationError::InvariantViolation(format!(
            "{unvisited} voxels were never covered by a patch (first at {first:?})"
        )));
    }

    if scores.shape()[1..] != *visits.shape() {
        return Err(SegmentationError::ShapeMismatch(format!(
            "score volume {:?} does not match visit counts {:?}",
            scores.shape(),
            visits.shape()
        )));
    }

    for mut channel in scores.axis_iter_mut(Axis(0)) {
        Zip::from(&mut channel)
            .and(&visits)
            .for_each(|score, &count| *score /= count as f32);
    }

    let mut labels = LabelVolume::zeros(visits.raw_dim());
    Zip::from(&mut labels)
        .and(scores.lanes(Axis(0)))
        .for_each(|label, class_scores| {
            let mut best = 0usize;
            for (class, &score) in class_scores.iter().enumerate().skip(1) {
                if score > class_scores[best] {
                    best = class;
                }
            }
            *label = best as u16;
        });

    Ok((labels, scores))
}
