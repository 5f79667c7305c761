//! Largest connected foreground component of a label volume.

use std::collections::VecDeque;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::error::SegmentationError;
use crate::volume::{shape3, LabelVolume};

/// Neighborhood used when growing components.
///
/// `Six` joins face neighbors, `Eighteen` adds edge neighbors and
/// `TwentySix` adds corner neighbors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    Six,
    Eighteen,
    #[default]
    TwentySix,
}

impl Connectivity {
    pub fn neighbor_count(self) -> u8 {
        match self {
            Self::Six => 6,
            Self::Eighteen => 18,
            Self::TwentySix => 26,
        }
    }

    fn offsets(self) -> Vec<[isize; 3]> {
        let max_nonzero = match self {
            Self::Six => 1,
            Self::Eighteen => 2,
            Self::TwentySix => 3,
        };
        let mut offsets = Vec::with_capacity(usize::from(self.neighbor_count()));
        for dx in -1isize..=1 {
            for dy in -1isize..=1 {
                for dz in -1isize..=1 {
                    let nonzero = [dx, dy, dz].iter().filter(|&&d| d != 0).count();
                    if nonzero > 0 && nonzero <= max_nonzero {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        offsets
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Self::Six),
            18 => Ok(Self::Eighteen),
            26 => Ok(Self::TwentySix),
            other => Err(format!("connectivity must be 6, 18 or 26, got {other}")),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(value: Connectivity) -> Self {
        value.neighbor_count()
    }
}

/// Keep only the largest connected region of non-zero voxels.
///
/// Returns a binary volume (1 inside the kept component). When two components
/// have the same size the one reached first in x-y-z scan order wins.
pub fn largest_component(
    labels: &LabelVolume,
    connectivity: Connectivity,
) -> Result<LabelVolume, SegmentationError> {
    let shape = shape3(labels);
    let offsets = connectivity.offsets();
    let mut component_ids = Array3::<u32>::zeros(labels.raw_dim());
    let mut sizes: Vec<usize> = Vec::new();
    let mut queue = VecDeque::new();

    for ((x, y, z), &label) in labels.indexed_iter() {
        if label == 0 || component_ids[[x, y, z]] != 0 {
            continue;
        }

        sizes.push(0);
        let id = sizes.len() as u32;
        component_ids[[x, y, z]] = id;
        queue.push_back([x, y, z]);

        while let Some(voxel) = queue.pop_front() {
            sizes[id as usize - 1] += 1;
            for offset in &offsets {
                let Some(neighbor) = step(voxel, *offset, shape) else {
                    continue;
                };
                if labels[neighbor] != 0 && component_ids[neighbor] == 0 {
                    component_ids[neighbor] = id;
                    queue.push_back(neighbor);
                }
            }
        }
    }

    let mut largest: Option<(u32, usize)> = None;
    for (index, &size) in sizes.iter().enumerate() {
        if largest.map_or(true, |(_, best)| size > best) {
            largest = Some((index as u32 + 1, size));
        }
    }
    let (keep, _) = largest.ok_or(SegmentationError::EmptyForeground)?;

    Ok(component_ids.mapv(|id| u16::from(id == keep)))
}

fn step(voxel: [usize; 3], offset: [isize; 3], shape: [usize; 3]) -> Option<[usize; 3]> {
    let mut next = [0usize; 3];
    for axis in 0..3 {
        let coordinate = voxel[axis].checked_add_signed(offset[axis])?;
        if coordinate >= shape[axis] {
            return None;
        }
        next[axis] = coordinate;
    }
    Some(next)
}
