//! Per-case overlap and surface-distance metrics.
//!
//! [`SegmentationMetrics`] is the seam the case driver evaluates through;
//! [`SurfaceDistanceMetrics`] is the built-in implementation (Dice, Jaccard,
//! 95th-percentile Hausdorff distance and average surface distance on binary
//! masks, non-zero meaning foreground).

use std::ops::{Add, AddAssign};

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Metric tuple for one case, or an average over several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseMetrics {
    pub dice: f64,
    pub jaccard: f64,
    pub hd95: f64,
    pub asd: f64,
}

impl CaseMetrics {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            dice: self.dice * factor,
            jaccard: self.jaccard * factor,
            hd95: self.hd95 * factor,
            asd: self.asd * factor,
        }
    }
}

impl Add for CaseMetrics {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            dice: self.dice + other.dice,
            jaccard: self.jaccard + other.jaccard,
            hd95: self.hd95 + other.hd95,
            asd: self.asd + other.asd,
        }
    }
}

impl AddAssign for CaseMetrics {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for CaseMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dice={:.4} jaccard={:.4} hd95={:.4} asd={:.4}",
            self.dice, self.jaccard, self.hd95, self.asd
        )
    }
}

/// Running sum of case metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricAccumulator {
    total: CaseMetrics,
    cases: usize,
}

impl MetricAccumulator {
    pub fn push(&mut self, metrics: CaseMetrics) {
        self.total += metrics;
        self.cases += 1;
    }

    pub fn cases(&self) -> usize {
        self.cases
    }

    /// Element-wise mean; the zero tuple when nothing was pushed.
    pub fn average(&self) -> CaseMetrics {
        if self.cases == 0 {
            return CaseMetrics::zero();
        }
        self.total.scaled(1.0 / self.cases as f64)
    }
}

/// Scores a binary prediction against a binary ground truth.
pub trait SegmentationMetrics {
    /// Both masks must have the same shape and at least one foreground voxel.
    fn evaluate(&self, prediction: ArrayView3<'_, u16>, truth: ArrayView3<'_, u16>)
        -> Result<CaseMetrics>;
}

/// Overlap plus surface-distance metrics with physical voxel spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceDistanceMetrics {
    pub spacing: [f64; 3],
}

impl Default for SurfaceDistanceMetrics {
    fn default() -> Self {
        Self {
            spacing: [1.0, 1.0, 1.0],
        }
    }
}

impl SegmentationMetrics for SurfaceDistanceMetrics {
    fn evaluate(
        &self,
        prediction: ArrayView3<'_, u16>,
        truth: ArrayView3<'_, u16>,
    ) -> Result<CaseMetrics> {
        if prediction.shape() != truth.shape() {
            bail!(
                "prediction shape {:?} does not match ground truth {:?}",
                prediction.shape(),
                truth.shape()
            );
        }

        let prediction = prediction.mapv(|v| v != 0);
        let truth = truth.mapv(|v| v != 0);
        if !prediction.iter().any(|&v| v) {
            bail!("prediction has no foreground voxels");
        }
        if !truth.iter().any(|&v| v) {
            bail!("ground truth has no foreground voxels");
        }

        let (dice, jaccard) = overlap(&prediction, &truth);
        let prediction_to_truth = surface_distances(&prediction, &truth, self.spacing);
        let truth_to_prediction = surface_distances(&truth, &prediction, self.spacing);

        let asd = mean(&prediction_to_truth);
        let mut symmetric = prediction_to_truth;
        symmetric.extend(truth_to_prediction);
        let hd95 = percentile(&mut symmetric, 95.0);

        Ok(CaseMetrics {
            dice,
            jaccard,
            hd95,
            asd,
        })
    }
}

fn overlap(prediction: &Array3<bool>, truth: &Array3<bool>) -> (f64, f64) {
    let mut intersection = 0usize;
    let mut predicted = 0usize;
    let mut actual = 0usize;
    Zip::from(prediction).and(truth).for_each(|&p, &t| {
        intersection += usize::from(p && t);
        predicted += usize::from(p);
        actual += usize::from(t);
    });

    let union = predicted + actual - intersection;
    let dice = if predicted + actual == 0 {
        0.0
    } else {
        2.0 * intersection as f64 / (predicted + actual) as f64
    };
    let jaccard = if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    };
    (dice, jaccard)
}

/// Distances from every surface voxel of `from` to the nearest surface voxel
/// of `to`.
fn surface_distances(from: &Array3<bool>, to: &Array3<bool>, spacing: [f64; 3]) -> Vec<f64> {
    let from_surface = surface(from);
    let to_surface = surface(to);
    let distances = distance_to_nearest(&to_surface, spacing);

    Zip::from(&from_surface)
        .and(&distances)
        .fold(Vec::new(), |mut acc, &on_surface, &distance| {
            if on_surface {
                acc.push(distance);
            }
            acc
        })
}

/// Foreground voxels that lose a face neighbor under one erosion. Voxels on
/// the array border always count as surface.
fn surface(mask: &Array3<bool>) -> Array3<bool> {
    let (w, h, d) = mask.dim();
    let extent = [w, h, d];
    Array3::from_shape_fn(mask.raw_dim(), |(x, y, z)| {
        if !mask[[x, y, z]] {
            return false;
        }
        let voxel = [x, y, z];
        for axis in 0..3 {
            if voxel[axis] == 0 || voxel[axis] + 1 == extent[axis] {
                return true;
            }
            for delta in [-1isize, 1] {
                let mut neighbor = voxel;
                neighbor[axis] = voxel[axis].wrapping_add_signed(delta);
                if !mask[neighbor] {
                    return true;
                }
            }
        }
        false
    })
}

/// Exact Euclidean distance from every voxel to the nearest `true` voxel of
/// `features`, one separable pass per axis.
fn distance_to_nearest(features: &Array3<bool>, spacing: [f64; 3]) -> Array3<f64> {
    let mut squared = features.mapv(|f| if f { 0.0 } else { f64::INFINITY });

    for (axis, &step) in spacing.iter().enumerate() {
        let n = squared.len_of(Axis(axis));
        let mut input = vec![0.0; n];
        let mut output = vec![0.0; n];
        let mut envelope = LowerEnvelope::with_len(n);
        for mut lane in squared.lanes_mut(Axis(axis)) {
            for (dst, &src) in input.iter_mut().zip(lane.iter()) {
                *dst = src;
            }
            envelope.transform(&input, step, &mut output);
            for (dst, &src) in lane.iter_mut().zip(&output) {
                *dst = src;
            }
        }
    }

    squared.mapv_into(f64::sqrt)
}

/// Scratch space for the 1D squared distance transform of Felzenszwalb and
/// Huttenlocher.
struct LowerEnvelope {
    vertices: Vec<usize>,
    boundaries: Vec<f64>,
}

impl LowerEnvelope {
    fn with_len(n: usize) -> Self {
        Self {
            vertices: vec![0; n],
            boundaries: vec![0.0; n + 1],
        }
    }

    fn transform(&mut self, f: &[f64], step: f64, out: &mut [f64]) {
        let position = |i: usize| i as f64 * step;
        let mut top: Option<usize> = None;

        for q in 0..f.len() {
            if !f[q].is_finite() {
                continue;
            }
            let xq = position(q);
            loop {
                let Some(k) = top else {
                    self.vertices[0] = q;
                    self.boundaries[0] = f64::NEG_INFINITY;
                    self.boundaries[1] = f64::INFINITY;
                    top = Some(0);
                    break;
                };
                let p = self.vertices[k];
                let xp = position(p);
                let crossing = ((f[q] + xq * xq) - (f[p] + xp * xp)) / (2.0 * (xq - xp));
                if crossing <= self.boundaries[k] {
                    top = k.checked_sub(1);
                    continue;
                }
                self.vertices[k + 1] = q;
                self.boundaries[k + 1] = crossing;
                self.boundaries[k + 2] = f64::INFINITY;
                top = Some(k + 1);
                break;
            }
        }

        if top.is_none() {
            out.fill(f64::INFINITY);
            return;
        }

        let mut k = 0usize;
        for (q, slot) in out.iter_mut().enumerate() {
            let x = position(q);
            while self.boundaries[k + 1] < x {
                k += 1;
            }
            let p = self.vertices[k];
            let dx = x - position(p);
            *slot = dx * dx + f[p];
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let rank = q / 100.0 * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(shape: (usize, usize, usize), from: [usize; 3], size: [usize; 3]) -> Array3<u16> {
        Array3::from_shape_fn(shape, |(x, y, z)| {
            let inside = (from[0]..from[0] + size[0]).contains(&x)
                && (from[1]..from[1] + size[1]).contains(&y)
                && (from[2]..from[2] + size[2]).contains(&z);
            u16::from(inside)
        })
    }

    #[test]
    fn identical_masks_score_perfectly() {
        let mask = cube((10, 10, 10), [2, 2, 2], [4, 4, 4]);
        let metrics = SurfaceDistanceMetrics::default()
            .evaluate(mask.view(), mask.view())
            .expect("metrics");
        assert!((metrics.dice - 1.0).abs() < 1e-12);
        assert!((metrics.jaccard - 1.0).abs() < 1e-12);
        assert_eq!(metrics.hd95, 0.0);
        assert_eq!(metrics.asd, 0.0);
    }

    #[test]
    fn shifted_cube_has_unit_distances() {
        let prediction = cube((12, 12, 12), [3, 3, 3], [4, 4, 4]);
        let truth = cube((12, 12, 12), [4, 3, 3], [4, 4, 4]);
        let metrics = SurfaceDistanceMetrics::default()
            .evaluate(prediction.view(), truth.view())
            .expect("metrics");
        assert!((metrics.dice - 0.75).abs() < 1e-12);
        assert!((metrics.jaccard - 0.6).abs() < 1e-12);
        assert!((metrics.hd95 - 1.0).abs() < 1e-9);
        assert!(metrics.asd > 0.0 && metrics.asd <= 1.0);
    }

    #[test]
    fn spacing_scales_distances() {
        let prediction = cube((12, 12, 12), [3, 3, 3], [4, 4, 4]);
        let truth = cube((12, 12, 12), [5, 3, 3], [4, 4, 4]);
        let unit = SurfaceDistanceMetrics::default()
            .evaluate(prediction.view(), truth.view())
            .expect("unit");
        let stretched = SurfaceDistanceMetrics {
            spacing: [2.0, 1.0, 1.0],
        }
        .evaluate(prediction.view(), truth.view())
        .expect("stretched");
        assert!((unit.hd95 - 2.0).abs() < 1e-9);
        assert!((stretched.hd95 - 4.0).abs() < 1e-9);
    }

    #[test]
    fn empty_masks_are_rejected() {
        let empty = Array3::<u16>::zeros((4, 4, 4));
        let full = cube((4, 4, 4), [1, 1, 1], [2, 2, 2]);
        let metrics = SurfaceDistanceMetrics::default();
        assert!(metrics.evaluate(empty.view(), full.view()).is_err());
        assert!(metrics.evaluate(full.view(), empty.view()).is_err());
    }

    #[test]
    fn distance_transform_matches_brute_force() {
        let features = Array3::from_shape_fn((7, 5, 6), |(x, y, z)| (x * 3 + y * 5 + z * 7) % 13 == 0);
        let spacing = [1.5, 1.0, 0.5];
        let fast = distance_to_nearest(&features, spacing);
        for ((x, y, z), &distance) in fast.indexed_iter() {
            let mut best = f64::INFINITY;
            for ((fx, fy, fz), &is_feature) in features.indexed_iter() {
                if is_feature {
                    let dx = (x as f64 - fx as f64) * spacing[0];
                    let dy = (y as f64 - fy as f64) * spacing[1];
                    let dz = (z as f64 - fz as f64) * spacing[2];
                    best = best.min((dx * dx + dy * dy + dz * dz).sqrt());
                }
            }
            assert!((distance - best).abs() < 1e-9, "at {:?}", (x, y, z));
        }
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&mut values, 50.0), 3.0);
        assert!((percentile(&mut values, 95.0) - 4.8).abs() < 1e-12);
    }

    #[test]
    fn accumulator_averages_pushed_cases() {
        let mut accumulator = MetricAccumulator::default();
        assert_eq!(accumulator.average(), CaseMetrics::zero());
        accumulator.push(CaseMetrics {
            dice: 0.8,
            jaccard: 0.6,
            hd95: 4.0,
            asd: 1.0,
        });
        accumulator.push(CaseMetrics::zero());
        let average = accumulator.average();
        assert_eq!(accumulator.cases(), 2);
        assert!((average.dice - 0.4).abs() < 1e-12);
        assert!((average.hd95 - 2.0).abs() < 1e-12);
    }
}
