//! Loading evaluation cases and persisting predictions as NIfTI volumes.
//!
//! A case directory holds `image.nii.gz` and `label.nii.gz` (plain `.nii` is
//! accepted as well). Outputs are written as `f32` `.nii.gz` files.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array3, ArrayView3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;

use crate::volume::{LabelVolume, Shape3, Volume};

pub const IMAGE_VOLUME_NAME: &str = "image";
pub const LABEL_VOLUME_NAME: &str = "label";
pub const NIFTI_EXTENSION: &str = "nii.gz";
const PLAIN_NIFTI_EXTENSION: &str = "nii";

/// One evaluation case: an intensity volume and its ground-truth labels.
#[derive(Debug, Clone)]
pub struct Case {
    pub id: String,
    pub image: Volume,
    pub label: LabelVolume,
}

/// Reads a case keyed by its path.
pub trait CaseSource {
    fn load_case(&self, path: &Path) -> Result<Case>;
}

/// Writes named volumes produced during evaluation.
pub trait VolumeSink {
    fn write_volume(&self, name: &str, volume: ArrayView3<'_, f32>) -> Result<()>;
}

/// Reads case directories of NIfTI volumes. The case id is the directory name.
///
/// Paths are opened exactly as given; callers resolve them beforehand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiCaseSource;

/// Writes `<dir>/<name>.nii.gz` for every volume it receives.
#[derive(Debug, Clone)]
pub struct NiftiVolumeSink {
    dir: PathBuf,
}

impl NiftiVolumeSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Path of volume `name` inside `dir`, preferring the compressed file.
pub fn volume_path(dir: &Path, name: &str) -> PathBuf {
    let compressed = dir.join(format!("{name}.{NIFTI_EXTENSION}"));
    if compressed.exists() {
        return compressed;
    }
    let plain = dir.join(format!("{name}.{PLAIN_NIFTI_EXTENSION}"));
    if plain.exists() {
        plain
    } else {
        compressed
    }
}

/// Spatial extent described by a NIfTI header.
///
/// Dimensions past the third must all be 1, so a single-frame 4D file loads
/// as a 3D volume.
pub fn header_shape(header: &NiftiHeader) -> Result<Shape3> {
    let rank = usize::from(header.dim[0]);
    ensure!(
        (3..=7).contains(&rank),
        "expected a 3D volume, header declares {rank} dimensions"
    );
    let extents = &header.dim[1..=rank];
    if let Some(axis) = extents.iter().position(|&extent| extent == 0) {
        bail!("header declares a zero extent on axis {axis}: {extents:?}");
    }
    extents
        .iter()
        .try_fold(1usize, |count, &extent| count.checked_mul(usize::from(extent)))
        .with_context(|| format!("voxel count overflows for extents {extents:?}"))?;
    if extents[3..].iter().any(|&extent| extent != 1) {
        bail!("expected a single 3D frame, header declares extents {extents:?}");
    }

    Ok([
        usize::from(extents[0]),
        usize::from(extents[1]),
        usize::from(extents[2]),
    ])
}

/// Reads one NIfTI file into an `f32` volume, applying the header's scaling.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let header = NiftiHeader::from_file(path)
        .with_context(|| format!("failed to read NIfTI header: {}", path.display()))?;
    let shape = header_shape(&header)
        .with_context(|| format!("unsupported NIfTI geometry in {}", path.display()))?;

    let object = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("failed to read NIfTI volume: {}", path.display()))?;
    let data = object
        .into_volume()
        .into_ndarray::<f32>()
        .with_context(|| format!("failed to decode NIfTI voxels: {}", path.display()))?;

    // nifti links its own ndarray release; copy across in logical order.
    let values: Vec<f32> = data.iter().copied().collect();
    Array3::from_shape_vec((shape[0], shape[1], shape[2]), values).with_context(|| {
        format!(
            "voxel data of {} does not match header extents {shape:?}",
            path.display()
        )
    })
}

/// Writes `volume` as an `f32` NIfTI file. A `.gz` suffix compresses it.
pub fn write_volume(path: &Path, volume: ArrayView3<'_, f32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }

    let values: Vec<f32> = volume.iter().copied().collect();
    let exported = ndarray_nifti::Array3::from_shape_vec(volume.dim(), values)
        .context("failed to lay out volume for NIfTI export")?;
    WriterOptions::new(path)
        .write_nifti(&exported)
        .with_context(|| format!("failed to write NIfTI volume: {}", path.display()))?;

    debug!(path = %path.display(), shape = ?volume.dim(), "Wrote volume");
    Ok(())
}

/// Converts label intensities to class indices.
///
/// Every voxel must hold a finite whole number in the `u16` range.
pub fn labels_from_f32(volume: &Volume) -> Result<LabelVolume> {
    if let Some(((x, y, z), value)) = volume.indexed_iter().find(|(_, &value)| {
        !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > f32::from(u16::MAX)
    }) {
        bail!("label voxel [{x}, {y}, {z}] holds {value}, expected a class index in 0..=65535");
    }
    Ok(volume.mapv(|value| value as u16))
}

impl CaseSource for NiftiCaseSource {
    fn load_case(&self, path: &Path) -> Result<Case> {
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("case path has no usable name: {}", path.display()))?
            .to_string();

        let image = read_volume(&volume_path(path, IMAGE_VOLUME_NAME))?;
        let label = read_volume(&volume_path(path, LABEL_VOLUME_NAME))?;
        if image.dim() != label.dim() {
            bail!(
                "case {id}: image shape {:?} does not match label shape {:?}",
                image.dim(),
                label.dim()
            );
        }
        if image.iter().any(|value| !value.is_finite()) {
            bail!("case {id}: image contains non-finite intensities");
        }
        let label = labels_from_f32(&label).with_context(|| format!("case {id}: invalid labels"))?;

        Ok(Case { id, image, label })
    }
}

impl VolumeSink for NiftiVolumeSink {
    fn write_volume(&self, name: &str, volume: ArrayView3<'_, f32>) -> Result<()> {
        write_volume(&self.dir.join(format!("{name}.{NIFTI_EXTENSION}")), volume)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn header_with_dims(dims: &[u16]) -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.dim = [1; 8];
        header.dim[0] = dims.len() as u16;
        header.dim[1..=dims.len()].copy_from_slice(dims);
        header
    }

    fn write_case(dir: &Path, image: &Volume, label: &Volume) {
        write_volume(&dir.join("image.nii.gz"), image.view()).expect("image");
        write_volume(&dir.join("label.nii.gz"), label.view()).expect("label");
    }

    #[test]
    fn write_then_read_preserves_values_and_layout() {
        let dir = tempdir().expect("tempdir");
        let volume = Volume::from_shape_fn((3, 4, 5), |(x, y, z)| (x * 100 + y * 10 + z) as f32 - 7.5);
        let path = dir.path().join("scan.nii.gz");
        write_volume(&path, volume.view()).expect("write");

        let header = NiftiHeader::from_file(&path).expect("header");
        assert_eq!(header_shape(&header).expect("shape"), [3, 4, 5]);
        assert_eq!(read_volume(&path).expect("read"), volume);
    }

    #[test]
    fn load_case_uses_directory_name_as_id() {
        let root = tempdir().expect("tempdir");
        let case_dir = root.path().join("case_0042");
        let image = Volume::from_elem((2, 2, 2), 3.0);
        let label = Volume::from_shape_fn((2, 2, 2), |(x, _, _)| x as f32);
        write_case(&case_dir, &image, &label);

        let case = NiftiCaseSource.load_case(&case_dir).expect("load");
        assert_eq!(case.id, "case_0042");
        assert_eq!(case.image, image);
        assert_eq!(case.label[[1, 0, 0]], 1);
        assert_eq!(case.label[[0, 1, 1]], 0);
    }

    #[test]
    fn sink_writes_compressed_files_under_its_directory() {
        let root = tempdir().expect("tempdir");
        let sink = NiftiVolumeSink::new(root.path().join("predictions"));
        sink.write_volume("case_a_pred", Volume::ones((2, 3, 4)).view())
            .expect("write");

        let path = root.path().join("predictions/case_a_pred.nii.gz");
        assert!(path.is_file());
        assert_eq!(read_volume(&path).expect("read").dim(), (2, 3, 4));
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("scan.nii");
        fs::write(&path, b"definitely not a nifti header").expect("write");
        assert!(read_volume(&path).is_err());
    }

    #[test]
    fn header_extents_are_validated_before_reading() {
        assert_eq!(header_shape(&header_with_dims(&[4, 5, 6])).expect("3d"), [4, 5, 6]);
        assert_eq!(header_shape(&header_with_dims(&[4, 5, 6, 1])).expect("4d"), [4, 5, 6]);

        let huge = header_with_dims(&[u16::MAX; 7]);
        assert!(header_shape(&huge).is_err());
        assert!(header_shape(&header_with_dims(&[4, 0, 6])).is_err());
        assert!(header_shape(&header_with_dims(&[4, 5])).is_err());
        assert!(header_shape(&header_with_dims(&[4, 5, 6, 2])).is_err());

        let mut corrupt = header_with_dims(&[4, 5, 6]);
        corrupt.dim[0] = 40;
        assert!(header_shape(&corrupt).is_err());
    }

    #[test]
    fn fractional_negative_and_non_finite_labels_are_rejected() {
        let valid = Volume::from_shape_fn((2, 2, 1), |(x, y, _)| (x * 2 + y) as f32);
        let labels = labels_from_f32(&valid).expect("integral labels");
        assert_eq!(labels[[1, 1, 0]], 3);
        assert_eq!(
            labels_from_f32(&Volume::from_elem((1, 1, 1), 65535.0)).expect("max")[[0, 0, 0]],
            u16::MAX
        );

        for bad in [0.5, -1.0, f32::NAN, f32::INFINITY, 70000.0] {
            let mut volume = Volume::zeros((2, 2, 2));
            volume[[1, 0, 1]] = bad;
            let error = labels_from_f32(&volume).unwrap_err();
            assert!(error.to_string().contains("[1, 0, 1]"), "{bad}: {error}");
        }
    }

    #[test]
    fn case_with_fractional_labels_is_rejected() {
        let root = tempdir().expect("tempdir");
        let case_dir = root.path().join("soft");
        write_case(
            &case_dir,
            &Volume::zeros((2, 2, 2)),
            &Volume::from_elem((2, 2, 2), 0.4),
        );
        let error = NiftiCaseSource.load_case(&case_dir).unwrap_err();
        assert!(format!("{error:#}").contains("invalid labels"));
    }

    #[test]
    fn mismatched_case_shapes_are_rejected() {
        let root = tempdir().expect("tempdir");
        let case_dir = root.path().join("bad");
        write_case(&case_dir, &Volume::zeros((2, 2, 2)), &Volume::zeros((2, 2, 3)));
        assert!(NiftiCaseSource.load_case(&case_dir).is_err());
    }
}
