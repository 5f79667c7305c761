//! Array aliases shared by the sliding-window pipeline.
//!
//! All spatial arrays are indexed `[x, y, z]`; score arrays carry the class
//! axis first, `[class, x, y, z]`.

use ndarray::{Array3, Array4};

/// Extent of a 3D array or window along `x`, `y`, `z`.
pub type Shape3 = [usize; 3];

/// Scalar intensity volume.
pub type Volume = Array3<f32>;

/// Integer class index per voxel, in `[0, num_classes)`.
pub type LabelVolume = Array3<u16>;

/// Per-class scores, `(num_classes, x, y, z)`.
pub type ScoreVolume = Array4<f32>;

/// Number of patches that covered each voxel.
pub type VisitCounts = Array3<u32>;

/// Shape of a 3D array as a [`Shape3`].
pub fn shape3<A>(array: &Array3<A>) -> Shape3 {
    let (x, y, z) = array.dim();
    [x, y, z]
}

/// Number of non-zero voxels in a label volume.
pub fn foreground_count(labels: &LabelVolume) -> usize {
    labels.iter().filter(|&&label| label != 0).count()
}

/// Widen a label volume to `f32` for export.
pub fn labels_to_f32(labels: &LabelVolume) -> Volume {
    labels.mapv(f32::from)
}

/// Shift and scale intensities to zero mean and unit variance.
pub fn zscore(mut volume: Volume) -> Volume {
    let count = volume.len().max(1) as f64;
    let mean = volume.iter().map(|&v| f64::from(v)).sum::<f64>() / count;
    let variance = volume
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / count;
    let std = variance.sqrt().max(1e-8);
    volume.mapv_inplace(|v| ((f64::from(v) - mean) / std) as f32);
    volume
}
