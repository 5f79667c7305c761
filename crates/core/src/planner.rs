//! Patch origin planning for sliding-window coverage.

use crate::error::SegmentationError;
use crate::volume::Shape3;

/// Origins along one axis so that windows of `patch_extent` cover
/// `padded_extent` with the given nominal stride.
///
/// The first origin is always 0 and the last one is clamped to
/// `padded_extent - patch_extent`. Full coverage requires
/// `stride <= patch_extent`; [`PatchPlan::new`] enforces that.
pub fn plan_axis(padded_extent: usize, patch_extent: usize, stride: usize) -> Vec<usize> {
    debug_assert!(stride > 0);
    debug_assert!(padded_extent >= patch_extent);
    let last = padded_extent - patch_extent;
    let count = last.div_ceil(stride) + 1;
    (0..count).map(|i| (stride * i).min(last)).collect()
}

/// Cartesian product of per-axis origins, visited x-outer, z-inner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub patch_size: Shape3,
    pub x: Vec<usize>,
    pub y: Vec<usize>,
    pub z: Vec<usize>,
}

impl PatchPlan {
    /// Plan a padded volume. `x` and `y` share `stride_xy`; `z` uses `stride_z`.
    pub fn new(
        padded_shape: Shape3,
        patch_size: Shape3,
        stride_xy: usize,
        stride_z: usize,
    ) -> Result<Self, SegmentationError> {
        validate_window(patch_size, stride_xy, stride_z)?;
        for (axis, (&extent, &patch)) in padded_shape.iter().zip(patch_size.iter()).enumerate() {
            if extent < patch {
                return Err(SegmentationError::ShapeMismatch(format!(
                    "axis {axis} extent {extent} is smaller than patch extent {patch}; pad first"
                )));
            }
        }

        Ok(Self {
            patch_size,
            x: plan_axis(padded_shape[0], patch_size[0], stride_xy),
            y: plan_axis(padded_shape[1], patch_size[1], stride_xy),
            z: plan_axis(padded_shape[2], patch_size[2], stride_z),
        })
    }

    pub fn len(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origins(&self) -> impl Iterator<Item = Shape3> + '_ {
        self.x.iter().flat_map(move |&x| {
            self.y
                .iter()
                .flat_map(move |&y| self.z.iter().map(move |&z| [x, y, z]))
        })
    }
}

/// Reject windows the planner cannot cover: zero extents, zero strides, and
/// strides longer than the patch along the axes they drive.
pub fn validate_window(
    patch_size: Shape3,
    stride_xy: usize,
    stride_z: usize,
) -> Result<(), SegmentationError> {
    if patch_size.contains(&0) {
        return Err(SegmentationError::InvalidWindow(format!(
            "patch size {patch_size:?} has a zero extent"
        )));
    }
    if stride_xy == 0 || stride_z == 0 {
        return Err(SegmentationError::InvalidWindow(format!(
            "strides must be positive (stride_xy={stride_xy}, stride_z={stride_z})"
        )));
    }
    for (axis, name, stride, stride_name) in [
        (0, "x", stride_xy, "stride_xy"),
        (1, "y", stride_xy, "stride_xy"),
        (2, "z", stride_z, "stride_z"),
    ] {
        if stride > patch_size[axis] {
            return Err(SegmentationError::InvalidWindow(format!(
                "{stride_name} {stride} exceeds the {name} patch extent {} and would leave gaps",
                patch_size[axis]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_origin_when_extent_equals_patch() {
        assert_eq!(plan_axis(112, 112, 18), vec![0]);
    }

    #[test]
    fn last_origin_is_clamped_to_far_edge() {
        let origins = plan_axis(100, 40, 25);
        assert_eq!(origins, vec![0, 25, 50, 60]);
    }

    #[test]
    fn exact_stride_multiple_has_no_duplicate() {
        assert_eq!(plan_axis(10, 4, 3), vec![0, 3, 6]);
    }

    #[test]
    fn origins_stay_in_bounds_for_many_combinations() {
        for extent in 1..40 {
            for patch in 1..=extent {
                for stride in 1..=patch {
                    let origins = plan_axis(extent, patch, stride);
                    assert_eq!(origins[0], 0);
                    assert_eq!(*origins.last().expect("non-empty"), extent - patch);
                    assert!(origins.windows(2).all(|pair| pair[0] <= pair[1]));

                    let mut covered = vec![false; extent];
                    for &origin in &origins {
                        covered[origin..origin + patch].fill(true);
                    }
                    assert!(covered.iter().all(|&c| c), "gap for {extent}/{patch}/{stride}");
                }
            }
        }
    }

    #[test]
    fn plan_uses_anisotropic_strides() {
        let plan = PatchPlan::new([20, 20, 12], [10, 10, 4], 5, 2).expect("valid plan");
        assert_eq!(plan.x, vec![0, 5, 10]);
        assert_eq!(plan.y, vec![0, 5, 10]);
        assert_eq!(plan.z, vec![0, 2, 4, 6, 8]);
        assert_eq!(plan.len(), 45);
    }

    #[test]
    fn origins_are_visited_x_outer_z_inner() {
        let plan = PatchPlan::new([3, 3, 3], [2, 2, 2], 1, 1).expect("valid plan");
        let origins: Vec<_> = plan.origins().collect();
        assert_eq!(origins.len(), 8);
        assert_eq!(origins[0], [0, 0, 0]);
        assert_eq!(origins[1], [0, 0, 1]);
        assert_eq!(origins[2], [0, 1, 0]);
        assert_eq!(origins[7], [1, 1, 1]);
    }

    #[test]
    fn rejects_stride_longer_than_patch() {
        let error = PatchPlan::new([50, 50, 50], [10, 10, 10], 11, 2).unwrap_err();
        assert!(matches!(error, SegmentationError::InvalidWindow(_)));
        let error = PatchPlan::new([50, 50, 50], [10, 10, 10], 5, 0).unwrap_err();
        assert!(matches!(error, SegmentationError::InvalidWindow(_)));
    }

    #[test]
    fn stride_error_names_the_axis_it_overruns() {
        let error = validate_window([12, 6, 8], 8, 4).unwrap_err();
        assert!(error.to_string().contains("stride_xy 8 exceeds the y patch extent 6"), "{error}");

        let error = validate_window([12, 12, 3], 8, 4).unwrap_err();
        assert!(error.to_string().contains("stride_z 4 exceeds the z patch extent 3"), "{error}");
    }

    #[test]
    fn rejects_unpadded_volume() {
        let error = PatchPlan::new([8, 50, 50], [10, 10, 10], 5, 5).unwrap_err();
        assert!(matches!(error, SegmentationError::ShapeMismatch(_)));
    }
}
