//! Thin wrappers around the voxel-intensity and segmentation arrays.
//!
//! Image loading and file formats live with external collaborators; the
//! fitting engine only relies on the shape/indexing contract enforced here:
//! grid `(X, Y, Z, B)`, mask `(X, Y, Z)` (or `(X, Y, Z, 1)`), shared spatial
//! dimensions, and both read-only for the duration of a fitting session.

use ndarray::{Array3, Array4, Axis};

use crate::{Error, Intensityf64, Result, Voxel};

/// 4-D array of signal intensities: three spatial axes plus the decay axis
/// indexed by b-value.
#[derive(Clone)]
pub struct VoxelGrid {
    data: Array4<Intensityf64>,
}

impl VoxelGrid {
    pub fn new(data: Array4<Intensityf64>) -> Self { Self { data } }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        let s = self.data.shape();
        (s[0], s[1], s[2], s[3])
    }

    /// Number of decay samples per voxel.
    pub fn n_decay(&self) -> usize { self.data.shape()[3] }

    /// The full decay signal of one voxel.
    pub fn signal(&self, (x, y, z): Voxel) -> Vec<Intensityf64> {
        self.data.slice(ndarray::s![x, y, z, ..]).to_vec()
    }

    pub fn data(&self) -> &Array4<Intensityf64> { &self.data }
}

/// 3-D array of non-negative integer labels. Zero is background; each
/// positive label identifies one region of interest.
#[derive(Clone)]
pub struct SegMask {
    data: Array3<u32>,
}

impl SegMask {
    pub fn new(data: Array3<u32>) -> Self { Self { data } }

    /// Accepts the `(X, Y, Z, 1)` layout some mask files carry.
    pub fn from_4d(data: Array4<u32>) -> Result<Self> {
        if data.shape()[3] != 1 {
            return Err(Error::Shape(format!(
                "mask must be (X, Y, Z) or (X, Y, Z, 1), got trailing extent {}",
                data.shape()[3]
            )));
        }
        Ok(Self { data: data.remove_axis(Axis(3)) })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        let s = self.data.shape();
        (s[0], s[1], s[2])
    }

    /// All voxels with a nonzero label, in row-major order. The order is
    /// stable for a given mask; downstream code must still re-key results by
    /// coordinate rather than rely on it.
    pub fn nonzero_voxels(&self) -> Vec<Voxel> {
        self.data.indexed_iter()
            .filter(|(_, &label)| label != 0)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Voxels carrying one specific label.
    pub fn voxels_with_label(&self, label: u32) -> Vec<Voxel> {
        self.data.indexed_iter()
            .filter(|(_, &l)| l == label)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Distinct nonzero labels, sorted ascending.
    pub fn labels(&self) -> Vec<u32> {
        let mut labels: Vec<u32> = self.data.iter().copied().filter(|&l| l != 0).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    pub fn data(&self) -> &Array3<u32> { &self.data }
}

/// Grid and mask must share their spatial dimensions.
pub fn check_compatible(grid: &VoxelGrid, mask: &SegMask) -> Result<()> {
    let (gx, gy, gz, _) = grid.shape();
    let (mx, my, mz) = mask.shape();
    if (gx, gy, gz) != (mx, my, mz) {
        return Err(Error::Shape(format!(
            "grid is {gx}x{gy}x{gz} but mask is {mx}x{my}x{mz}"
        )));
    }
    Ok(())
}
