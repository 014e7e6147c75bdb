//! One fitting session: a voxel grid, a segmentation mask, and a parameter
//! set, with the three ways of running them.

use crate::dispatch::fit_all;
use crate::image::{check_compatible, SegMask, VoxelGrid};
use crate::params::FitParams;
use crate::results::Results;
use crate::{Error, Result};

pub struct FitData {
    grid: VoxelGrid,
    mask: SegMask,
    pub params: FitParams,
}

impl FitData {
    /// Validates the shape contract and the parameter set up front, so the
    /// fit entry points only fail on genuinely new information.
    pub fn new(grid: VoxelGrid, mask: SegMask, params: FitParams) -> Result<Self> {
        check_compatible(&grid, &mask)?;
        params.validate()?;
        if grid.n_decay() != params.b_values().len() {
            return Err(Error::Shape(format!(
                "grid has {} decay samples but {} b-values are configured",
                grid.n_decay(), params.b_values().len()
            )));
        }
        Ok(Self { grid, mask, params })
    }

    pub fn grid(&self) -> &VoxelGrid { &self.grid }
    pub fn mask(&self) -> &SegMask { &self.mask }

    fn fresh_results(&self) -> Results {
        let (x, y, z, _) = self.grid.shape();
        Results::new((x, y, z), self.params.spectrum_bins())
    }

    /// Fit every nonzero-mask voxel independently.
    pub fn fit_pixel_wise(&self) -> Result<Results> {
        let args = self.params.pixel_args(&self.grid, &self.mask)?;
        let fit = self.params.bind_fit_function()?;
        let outputs = fit_all(&fit, &args, self.params.n_workers())?;
        let mut results = self.fresh_results();
        self.params.evaluate(&outputs, &mut results)?;
        Ok(results)
    }

    /// Fit one mean signal per segmentation label. Results are keyed by the
    /// label sentinel coordinate.
    pub fn fit_segmentation_wise(&self) -> Result<Results> {
        let args = self.params.seg_args(&self.grid, &self.mask)?;
        let fit = self.params.bind_fit_function()?;
        let outputs = fit_all(&fit, &args, self.params.n_workers())?;
        let mut results = self.fresh_results();
        self.params.evaluate(&outputs, &mut results)?;
        Ok(results)
    }

    /// Two-stage segmented IVIM fit: stage 1 pins one coefficient (and
    /// optionally T1) per voxel, stage 2 completes the remaining parameters
    /// with those constants in place.
    pub fn fit_segmented(&self) -> Result<Results> {
        let FitParams::IvimSegmented(p) = &self.params else {
            return Err(Error::Config(
                "segmented fitting needs IvimSegmented parameters".into(),
            ));
        };

        let stage_one = p.stage_one_params()?;
        let args_one = p.stage_one_args(&self.grid, &self.mask)?;
        let fit_one = FitParams::Ivim(stage_one).bind_fit_function()?;
        let outputs_one = fit_all(&fit_one, &args_one, p.full.n_workers)?;

        let (d_map, t1_map) = p.fixed_maps(&outputs_one, self.mask.shape());

        let args_two = p.stage_two_args(&self.grid, &self.mask, &d_map, t1_map.as_ref())?;
        let fit_two = p.bind_stage_two_fit();
        let outputs_two = fit_all(&fit_two, &args_two, p.full.n_workers)?;

        let full = p.reconstruct_full(&outputs_two, &d_map, t1_map.as_ref());
        let mut results = self.fresh_results();
        p.evaluate(&full, &mut results)?;
        Ok(results)
    }
}
