pub use crate::error::{Error, Result};

pub type Intensityf64 = f64;
pub type Diffusionf64 = f64; // mm²/s
pub type Fractionf64  = f64;

/// Spatial index into a `VoxelGrid`.
pub type Voxel = (usize, usize, usize);

pub use crate::params::{FitArg, FitOutput, FitParams, Boundaries, DiffusionGrid};
pub use crate::image::{VoxelGrid, SegMask};
pub use crate::results::Results;
pub use crate::fitdata::FitData;
