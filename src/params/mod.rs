//! Fit-method parameter sets and the work-item types shared by all of them.
//!
//! `FitParams` is a closed set of variants rather than an open trait: every
//! method the engine supports is listed here, config files name the variant
//! in their `Class` tag, and adding a method means adding a variant. Each
//! variant knows how to turn a grid+mask into per-voxel work items, how to
//! bind its solver into a sendable closure, and how to interpret the raw
//! parameter vectors afterwards.

pub mod ivim;
pub mod segmented;
pub mod spectral;

pub use ivim::IvimParams;
pub use segmented::{FixedComponent, IvimSegmentedParams};
pub use spectral::{SpectralCvParams, SpectralParams, SpectralRegParams};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::image::{check_compatible, SegMask, VoxelGrid};
use crate::results::Results;
use crate::{Error, Intensityf64, Result, Voxel};

/// One unit of fitting work: a coordinate, its decay signal, and any
/// per-voxel constants a previous stage produced.
#[derive(Clone, Debug, PartialEq)]
pub struct FitArg {
    pub coord: Voxel,
    pub signal: Vec<Intensityf64>,
    pub fixed: Vec<f64>,
}

/// The raw parameter vector a solver produced for one coordinate. All-zero
/// means the solver failed for that voxel.
#[derive(Clone, Debug, PartialEq)]
pub struct FitOutput {
    pub coord: Voxel,
    pub params: Vec<f64>,
}

/// A fully-bound fit function: everything except the per-voxel argument is
/// captured, so it can be handed to worker threads as-is.
pub type FitFn = Box<dyn Fn(&FitArg) -> FitOutput + Send + Sync>;

/// Box constraints plus starting point for the parametric fits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Boundaries {
    pub lower: Vec<f64>,
    pub start: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Boundaries {
    pub fn validate(&self) -> Result<()> {
        if self.lower.len() != self.start.len() || self.start.len() != self.upper.len() {
            return Err(Error::Config(format!(
                "boundary lengths differ: lower {}, start {}, upper {}",
                self.lower.len(), self.start.len(), self.upper.len()
            )));
        }
        for (i, ((&lo, &x0), &hi)) in self.lower.iter().zip(&self.start).zip(&self.upper).enumerate() {
            if !(lo <= x0 && x0 <= hi) {
                return Err(Error::Config(format!(
                    "boundary {i} violates lower <= start <= upper: {lo} / {x0} / {hi}"
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.start.len() }
    pub fn is_empty(&self) -> bool { self.start.is_empty() }
}

/// Logarithmically spaced grid of candidate diffusion coefficients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiffusionGrid {
    pub n_bins: usize,
    pub d_range: (f64, f64),
}

impl Default for DiffusionGrid {
    fn default() -> Self { Self { n_bins: 250, d_range: (1e-4, 2e-1) } }
}

impl DiffusionGrid {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.d_range;
        if self.n_bins == 0 {
            return Err(Error::Config("diffusion grid needs at least one bin".into()));
        }
        if !(0.0 < lo && lo < hi) {
            return Err(Error::Config(format!(
                "diffusion range must satisfy 0 < lo < hi, got ({lo}, {hi})"
            )));
        }
        Ok(())
    }

    /// Bin centres, ascending.
    pub fn bins(&self) -> Vec<f64> {
        let (lo, hi) = self.d_range;
        let n = self.n_bins;
        if n == 1 { return vec![lo] }
        (0..n).map(|i| lo * (hi / lo).powf(i as f64 / (n - 1) as f64)).collect()
    }

    /// Index of the bin closest to `d`.
    pub fn nearest_bin(&self, d: f64) -> usize {
        self.bins().iter().enumerate()
            .min_by_key(|(_, &b)| OrderedFloat((b - d).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Default b-value scheme of the acquisition protocol this engine grew up
/// with; any config file can override it.
pub(crate) fn default_b_values() -> Vec<f64> {
    vec![0., 5., 10., 20., 30., 40., 50., 75., 100., 150., 200., 250., 300., 400., 525., 750.]
}

pub(crate) fn default_n_workers() -> usize { 4 }

/// The closed set of fit methods. The `Class` tag in parameter files names
/// the variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Class")]
pub enum FitParams {
    Spectral(SpectralParams),
    SpectralReg(SpectralRegParams),
    SpectralCv(SpectralCvParams),
    Ivim(IvimParams),
    IvimSegmented(IvimSegmentedParams),
}

impl FitParams {
    pub fn validate(&self) -> Result<()> {
        match self {
            FitParams::Spectral(p) => p.validate(),
            FitParams::SpectralReg(p) => p.validate(),
            FitParams::SpectralCv(p) => p.validate(),
            FitParams::Ivim(p) => p.validate(),
            FitParams::IvimSegmented(p) => p.validate(),
        }
    }

    pub fn b_values(&self) -> &[f64] {
        match self {
            FitParams::Spectral(p) => &p.b_values,
            FitParams::SpectralReg(p) => &p.base.b_values,
            FitParams::SpectralCv(p) => &p.base.b_values,
            FitParams::Ivim(p) => &p.b_values,
            FitParams::IvimSegmented(p) => &p.full.b_values,
        }
    }

    pub fn set_b_values(&mut self, b_values: Vec<f64>) {
        match self {
            FitParams::Spectral(p) => p.b_values = b_values,
            FitParams::SpectralReg(p) => p.base.b_values = b_values,
            FitParams::SpectralCv(p) => p.base.b_values = b_values,
            FitParams::Ivim(p) => p.b_values = b_values,
            FitParams::IvimSegmented(p) => p.full.b_values = b_values,
        }
    }

    pub fn n_workers(&self) -> usize {
        match self {
            FitParams::Spectral(p) => p.n_workers,
            FitParams::SpectralReg(p) => p.base.n_workers,
            FitParams::SpectralCv(p) => p.base.n_workers,
            FitParams::Ivim(p) => p.n_workers,
            FitParams::IvimSegmented(p) => p.full.n_workers,
        }
    }

    pub fn set_n_workers(&mut self, n: usize) {
        match self {
            FitParams::Spectral(p) => p.n_workers = n,
            FitParams::SpectralReg(p) => p.base.n_workers = n,
            FitParams::SpectralCv(p) => p.base.n_workers = n,
            FitParams::Ivim(p) => p.n_workers = n,
            FitParams::IvimSegmented(p) => p.full.n_workers = n,
        }
    }

    /// Number of bins in the reconstructed spectrum volume.
    pub fn spectrum_bins(&self) -> usize {
        match self {
            FitParams::Spectral(p) => p.grid.n_bins,
            FitParams::SpectralReg(p) => p.base.grid.n_bins,
            FitParams::SpectralCv(p) => p.base.grid.n_bins,
            FitParams::Ivim(p) => p.grid.n_bins,
            FitParams::IvimSegmented(p) => p.full.grid.n_bins,
        }
    }

    pub fn max_iter(&self) -> usize {
        match self {
            FitParams::Spectral(p) => p.max_iter,
            FitParams::SpectralReg(p) => p.base.max_iter,
            FitParams::SpectralCv(p) => p.base.max_iter,
            FitParams::Ivim(p) => p.max_iter,
            FitParams::IvimSegmented(p) => p.full.max_iter,
        }
    }

    /// One work item per nonzero-mask voxel.
    pub fn pixel_args(&self, grid: &VoxelGrid, mask: &SegMask) -> Result<Vec<FitArg>> {
        self.check_inputs(grid, mask)?;
        match self {
            FitParams::Spectral(_) | FitParams::SpectralCv(_) | FitParams::Ivim(_) => {
                grid_pixel_args(grid, mask, 0)
            }
            // Regularized signals carry the zero padding for the penalty rows
            FitParams::SpectralReg(p) => grid_pixel_args(grid, mask, p.base.grid.n_bins),
            FitParams::IvimSegmented(_) => Err(Error::Config(
                "segmented fitting runs in two stages; use fit_segmented".into(),
            )),
        }
    }

    /// One work item per distinct label, carrying the label's mean signal.
    pub fn seg_args(&self, grid: &VoxelGrid, mask: &SegMask) -> Result<Vec<FitArg>> {
        self.check_inputs(grid, mask)?;
        match self {
            FitParams::SpectralReg(p) => grid_seg_args(grid, mask, p.base.grid.n_bins),
            FitParams::IvimSegmented(_) => Err(Error::Config(
                "segmented fitting runs in two stages; use fit_segmented".into(),
            )),
            _ => grid_seg_args(grid, mask, 0),
        }
    }

    /// Capture everything except the per-voxel argument into a sendable
    /// closure. Solver failure yields a zero vector, never a panic.
    pub fn bind_fit_function(&self) -> Result<FitFn> {
        match self {
            FitParams::Spectral(p) => Ok(p.bind()),
            FitParams::SpectralReg(p) => Ok(p.bind()),
            FitParams::SpectralCv(p) => Ok(p.bind()),
            FitParams::Ivim(p) => Ok(p.bind()),
            FitParams::IvimSegmented(_) => Err(Error::Config(
                "segmented fitting runs in two stages; use fit_segmented".into(),
            )),
        }
    }

    /// Interpret raw parameter vectors into diffusion values, fractions and
    /// reconstructed spectra.
    pub fn evaluate(&self, outputs: &[FitOutput], results: &mut Results) -> Result<()> {
        use crate::results::FractionPolicy;
        match self {
            FitParams::Spectral(p) => {
                results.eval_spectral(outputs, &p.b_values, &p.grid, FractionPolicy::Height)
            }
            FitParams::SpectralReg(p) => {
                results.eval_spectral(outputs, &p.base.b_values, &p.base.grid,
                                      FractionPolicy::GaussianArea)
            }
            // Cross-validated spectra are read like plain ones
            FitParams::SpectralCv(p) => {
                results.eval_spectral(outputs, &p.base.b_values, &p.base.grid,
                                      FractionPolicy::Height)
            }
            FitParams::Ivim(p) => {
                results.eval_ivim(outputs, &p.b_values, p.n_components, p.mixing_time, &p.grid)
            }
            FitParams::IvimSegmented(p) => p.evaluate(outputs, results),
        }
    }

    fn check_inputs(&self, grid: &VoxelGrid, mask: &SegMask) -> Result<()> {
        check_compatible(grid, mask)?;
        if grid.n_decay() != self.b_values().len() {
            return Err(Error::Shape(format!(
                "grid has {} decay samples but {} b-values are configured",
                grid.n_decay(), self.b_values().len()
            )));
        }
        Ok(())
    }
}

/// Sentinel coordinate for segmentation-wise results: the label number in
/// the first slot, zeros elsewhere.
pub fn seg_coord(label: u32) -> Voxel { (label as usize, 0, 0) }

pub(crate) fn grid_pixel_args(grid: &VoxelGrid, mask: &SegMask, pad: usize) -> Result<Vec<FitArg>> {
    let voxels = mask.nonzero_voxels();
    if voxels.is_empty() {
        return Err(Error::MissingInput("mask selects no voxels".into()));
    }
    Ok(voxels.into_iter().map(|coord| {
        let mut signal = grid.signal(coord);
        signal.resize(signal.len() + pad, 0.0);
        FitArg { coord, signal, fixed: vec![] }
    }).collect())
}

pub(crate) fn grid_seg_args(grid: &VoxelGrid, mask: &SegMask, pad: usize) -> Result<Vec<FitArg>> {
    let labels = mask.labels();
    if labels.is_empty() {
        return Err(Error::MissingInput("mask selects no voxels".into()));
    }
    Ok(labels.into_iter().map(|label| {
        let voxels = mask.voxels_with_label(label);
        let mut mean = vec![0.0; grid.n_decay()];
        for &v in &voxels {
            for (m, s) in mean.iter_mut().zip(grid.signal(v)) { *m += s }
        }
        let n = voxels.len() as f64;
        for m in mean.iter_mut() { *m /= n }
        mean.resize(mean.len() + pad, 0.0);
        FitArg { coord: seg_coord(label), signal: mean, fixed: vec![] }
    }).collect())
}
