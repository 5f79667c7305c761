//! Symmetric zero padding up to the patch size, and its inverse.

use ndarray::{s, Array3, Array4};

use crate::volume::{shape3, Shape3, Volume};

/// Voxels added before (`left`) and after (`right`) one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisPadding {
    pub left: usize,
    pub right: usize,
}

impl AxisPadding {
    /// Split a deficit so that an odd extra voxel goes to the right.
    fn for_deficit(deficit: usize) -> Self {
        let left = deficit / 2;
        Self {
            left,
            right: deficit - left,
        }
    }

    pub fn total(&self) -> usize {
        self.left + self.right
    }
}

/// Padding applied to one volume, kept until its outputs are cropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingDescriptor {
    pub axes: [AxisPadding; 3],
    pub original_shape: Shape3,
}

impl PaddingDescriptor {
    pub fn is_noop(&self) -> bool {
        self.axes.iter().all(|axis| axis.total() == 0)
    }

    pub fn padded_shape(&self) -> Shape3 {
        let mut shape = self.original_shape;
        for (extent, axis) in shape.iter_mut().zip(&self.axes) {
            *extent += axis.total();
        }
        shape
    }

    /// Slice the original region out of a spatial array.
    pub fn crop_spatial<A: Clone>(&self, array: Array3<A>) -> Array3<A> {
        if self.is_noop() {
            return array;
        }
        let [x0, y0, z0] = self.axes.map(|axis| axis.left);
        let [w, h, d] = self.original_shape;
        array
            .slice(s![x0..x0 + w, y0..y0 + h, z0..z0 + d])
            .to_owned()
    }

    /// Slice the original region out of a class-major score array.
    /// The class axis is left untouched.
    pub fn crop_scores(&self, scores: Array4<f32>) -> Array4<f32> {
        if self.is_noop() {
            return scores;
        }
        let [x0, y0, z0] = self.axes.map(|axis| axis.left);
        let [w, h, d] = self.original_shape;
        scores
            .slice(s![.., x0..x0 + w, y0..y0 + h, z0..z0 + d])
            .to_owned()
    }
}

/// Grow `volume` with zeros on every axis shorter than `patch_size`.
///
/// Axes already at least as long as the patch are left alone, so the returned
/// descriptor is all-zero when no axis needed padding and the volume is
/// returned unchanged.
pub fn pad_to_patch(volume: Volume, patch_size: Shape3) -> (Volume, PaddingDescriptor) {
    let original_shape = shape3(&volume);
    let mut axes = [AxisPadding::default(); 3];
    for (axis, (&extent, &patch)) in axes
        .iter_mut()
        .zip(original_shape.iter().zip(patch_size.iter()))
    {
        if extent < patch {
            *axis = AxisPadding::for_deficit(patch - extent);
        }
    }

    let descriptor = PaddingDescriptor {
        axes,
        original_shape,
    };
    if descriptor.is_noop() {
        return (volume, descriptor);
    }

    let mut padded = Volume::zeros(descriptor.padded_shape());
    let [x0, y0, z0] = axes.map(|axis| axis.left);
    let [w, h, d] = original_shape;
    padded
        .slice_mut(s![x0..x0 + w, y0..y0 + h, z0..z0 + d])
        .assign(&volume);
    (padded, descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape3) -> Volume {
        Volume::from_shape_fn(shape, |(x, y, z)| (x * 10_000 + y * 100 + z) as f32 + 1.0)
    }

    #[test]
    fn large_volume_is_not_padded() {
        let volume = ramp([8, 9, 10]);
        let (padded, descriptor) = pad_to_patch(volume.clone(), [4, 9, 2]);
        assert!(descriptor.is_noop());
        assert_eq!(padded, volume);
    }

    #[test]
    fn reference_scenario_padding() {
        let volume = Volume::zeros((100, 100, 60));
        let (padded, descriptor) = pad_to_patch(volume, [112, 112, 80]);
        assert_eq!(padded.dim(), (112, 112, 80));
        assert_eq!(descriptor.axes[0], AxisPadding { left: 6, right: 6 });
        assert_eq!(descriptor.axes[1], AxisPadding { left: 6, right: 6 });
        assert_eq!(descriptor.axes[2], AxisPadding { left: 10, right: 10 });
    }

    #[test]
    fn odd_deficit_biases_right() {
        let (padded, descriptor) = pad_to_patch(ramp([5, 8, 8]), [8, 8, 8]);
        assert_eq!(descriptor.axes[0], AxisPadding { left: 1, right: 2 });
        assert_eq!(padded.dim(), (8, 8, 8));
        assert_eq!(padded[[0, 0, 0]], 0.0);
        assert_eq!(padded[[1, 0, 0]], 1.0);
        assert_eq!(padded[[6, 0, 0]], 0.0);
    }

    #[test]
    fn pad_then_crop_recovers_original() {
        let volume = ramp([3, 7, 2]);
        let (padded, descriptor) = pad_to_patch(volume.clone(), [6, 4, 5]);
        assert_eq!(padded.dim(), (6, 7, 5));
        assert_eq!(descriptor.crop_spatial(padded), volume);
    }

    #[test]
    fn crop_scores_keeps_class_axis() {
        let (_, descriptor) = pad_to_patch(ramp([2, 2, 2]), [4, 4, 4]);
        let scores = Array4::from_shape_fn((3, 4, 4, 4), |(c, x, y, z)| {
            (c * 1000 + x * 100 + y * 10 + z) as f32
        });
        let cropped = descriptor.crop_scores(scores);
        assert_eq!(cropped.dim(), (3, 2, 2, 2));
        assert_eq!(cropped[[2, 0, 0, 0]], 2111.0);
    }
}
