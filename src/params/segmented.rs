//! Two-stage segmented IVIM fitting.
//!
//! Stage 1 fits a mono-exponential (optionally on a reduced b-value subset,
//! optionally with a T1 term) to pin one diffusion coefficient per voxel.
//! Stage 2 refits the full multi-exponential with that coefficient (and T1,
//! if fitted) held constant.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::{grid_pixel_args, Boundaries, FitArg, FitFn, FitOutput, IvimParams};
use crate::image::{SegMask, VoxelGrid};
use crate::model::{ivim_fixed_signal, lsq::curve_fit};
use crate::results::Results;
use crate::{Error, Result};

/// Which compartment stage 1 pins down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedComponent {
    DSlow,
    DInter,
    DFast,
}

impl FixedComponent {
    /// Position in the slow-to-fast coefficient layout.
    pub fn index(self) -> usize {
        match self {
            FixedComponent::DSlow => 0,
            FixedComponent::DInter => 1,
            FixedComponent::DFast => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IvimSegmentedParams {
    /// The multi-exponential model stage 2 completes.
    pub full: IvimParams,
    pub fixed_component: FixedComponent,
    /// Fit T1 in stage 1 and hold it constant in stage 2. Requires a mixing
    /// time on `full`.
    pub fixed_t1: bool,
    /// Stage-1 b-value subset; `None` uses all of them. Must be drawn from
    /// the full scheme.
    pub reduced_b_values: Option<Vec<f64>>,
}

impl Default for IvimSegmentedParams {
    fn default() -> Self {
        Self {
            full: IvimParams::default(),
            fixed_component: FixedComponent::DSlow,
            fixed_t1: false,
            reduced_b_values: None,
        }
    }
}

impl IvimSegmentedParams {
    pub fn validate(&self) -> Result<()> {
        self.full.validate()?;
        if self.fixed_component.index() >= self.full.n_components {
            return Err(Error::Config(format!(
                "cannot fix component {} of a {}-component model",
                self.fixed_component.index() + 1, self.full.n_components
            )));
        }
        if self.fixed_t1 && self.full.mixing_time.is_none() {
            return Err(Error::Config("fixed_t1 requires a mixing time".into()));
        }
        if self.full.mixing_time.is_some() && !self.fixed_t1 {
            return Err(Error::Config(
                "segmented fitting supports T1 only via fixed_t1".into(),
            ));
        }
        self.reduced_indices()?;
        Ok(())
    }

    /// Positions of the stage-1 b-values within the full scheme.
    pub fn reduced_indices(&self) -> Result<Vec<usize>> {
        let Some(reduced) = &self.reduced_b_values else {
            return Ok((0..self.full.b_values.len()).collect());
        };
        if reduced.is_empty() {
            return Err(Error::Config("reduced b-value set is empty".into()));
        }
        reduced.iter().map(|rb| {
            self.full.b_values.iter().position(|b| b == rb).ok_or_else(|| {
                Error::Config(format!("reduced b-value {rb} is not in the full scheme"))
            })
        }).collect()
    }

    /// The mono-exponential stage-1 model, bounds lifted from the fixed
    /// compartment's slot (plus S0 and, with `fixed_t1`, T1 defaults).
    pub fn stage_one_params(&self) -> Result<IvimParams> {
        let indices = self.reduced_indices()?;
        let full_bounds = self.full.bounds();
        let fi = self.fixed_component.index();
        let s0 = 2 * self.full.n_components - 1;
        let t1 = 2 * self.full.n_components;

        let pick = |v: &[f64]| {
            let mut out = vec![v[fi], v[s0]];
            if self.fixed_t1 { out.push(*v.get(t1).unwrap_or(&1750.0)) }
            out
        };

        Ok(IvimParams {
            b_values: indices.iter().map(|&i| self.full.b_values[i]).collect(),
            n_components: 1,
            mixing_time: if self.fixed_t1 { self.full.mixing_time } else { None },
            boundaries: Some(Boundaries {
                lower: pick(&full_bounds.lower),
                start: pick(&full_bounds.start),
                upper: pick(&full_bounds.upper),
            }),
            grid: self.full.grid.clone(),
            max_iter: self.full.max_iter,
            n_workers: self.full.n_workers,
        })
    }

    /// Stage-1 work items: pixel args with signals sliced to the reduced
    /// b-value subset.
    pub fn stage_one_args(&self, grid: &VoxelGrid, mask: &SegMask) -> Result<Vec<FitArg>> {
        let indices = self.reduced_indices()?;
        let args = grid_pixel_args(grid, mask, 0)?;
        Ok(args.into_iter().map(|mut arg| {
            arg.signal = indices.iter().map(|&i| arg.signal[i]).collect();
            arg
        }).collect())
    }

    /// Dense per-voxel maps of the stage-1 results. Layout of stage-1
    /// vectors is `[d, S0]` or `[d, S0, T1]`; failed voxels stay zero.
    pub fn fixed_maps(
        &self,
        outputs: &[FitOutput],
        shape: (usize, usize, usize),
    ) -> (Array3<f64>, Option<Array3<f64>>) {
        let mut d_map = Array3::zeros(shape);
        let mut t1_map = self.fixed_t1.then(|| Array3::zeros(shape));
        for out in outputs {
            d_map[[out.coord.0, out.coord.1, out.coord.2]] = out.params[0];
            if let Some(m) = t1_map.as_mut() {
                m[[out.coord.0, out.coord.1, out.coord.2]] = out.params[2];
            }
        }
        (d_map, t1_map)
    }

    /// Stage-2 work items: full signals plus the per-voxel constants.
    pub fn stage_two_args(
        &self,
        grid: &VoxelGrid,
        mask: &SegMask,
        d_map: &Array3<f64>,
        t1_map: Option<&Array3<f64>>,
    ) -> Result<Vec<FitArg>> {
        let args = grid_pixel_args(grid, mask, 0)?;
        Ok(args.into_iter().map(|mut arg| {
            let (x, y, z) = arg.coord;
            arg.fixed = vec![d_map[[x, y, z]]];
            if let Some(m) = t1_map { arg.fixed.push(m[[x, y, z]]) }
            arg
        }).collect())
    }

    /// Stage-2 bounds: the full bounds with the fixed coefficient's slot
    /// (and the T1 slot) removed.
    fn stage_two_bounds(&self) -> Boundaries {
        let full = self.full.bounds();
        let fi = self.fixed_component.index();
        let n_free = 2 * self.full.n_components - 1;
        let strip = |v: &[f64]| {
            let mut v: Vec<f64> = v.iter().copied().enumerate()
                .filter(|&(i, _)| i != fi)
                .map(|(_, x)| x)
                .collect();
            v.truncate(n_free);
            v
        };
        Boundaries {
            lower: strip(&full.lower),
            start: strip(&full.start),
            upper: strip(&full.upper),
        }
    }

    /// Bind stage 2: the multi-exponential with `FitArg::fixed` supplying
    /// the pinned coefficient (and T1).
    pub fn bind_stage_two_fit(&self) -> FitFn {
        let b_values = self.full.b_values.clone();
        let bounds = self.stage_two_bounds();
        let n_components = self.full.n_components;
        let fixed_index = self.fixed_component.index();
        let mixing_time = self.full.mixing_time;
        let max_iter = self.full.max_iter;
        let n_free = 2 * n_components - 1;
        Box::new(move |arg: &FitArg| {
            let d_fixed = arg.fixed[0];
            let t1_tm = mixing_time.and_then(|tm| arg.fixed.get(1).map(|&t1| (t1, tm)));
            let signal = &arg.signal;
            let residuals = |p: &[f64]| -> Vec<f64> {
                ivim_fixed_signal(&b_values, p, fixed_index, d_fixed, t1_tm, n_components)
                    .iter().zip(signal)
                    .map(|(model, s)| model - s)
                    .collect()
            };
            let params = curve_fit(residuals, &bounds.start, &bounds.lower, &bounds.upper, max_iter)
                .unwrap_or_else(|| vec![0.0; n_free]);
            FitOutput { coord: arg.coord, params }
        })
    }

    /// Merge stage-2 free parameters with the per-voxel constants back into
    /// the full `[d.., f.., S0, (T1)]` layout.
    ///
    /// A zero stage-2 vector marks a solver failure; it stays a zero vector
    /// of the full length rather than getting the stage-1 coefficient
    /// spliced in, so the voxel remains recognizable as failed downstream.
    pub fn reconstruct_full(
        &self,
        outputs: &[FitOutput],
        d_map: &Array3<f64>,
        t1_map: Option<&Array3<f64>>,
    ) -> Vec<FitOutput> {
        let fi = self.fixed_component.index();
        let full_len = 2 * self.full.n_components + usize::from(t1_map.is_some());
        outputs.iter().map(|out| {
            if out.params.iter().all(|&v| v == 0.0) {
                return FitOutput { coord: out.coord, params: vec![0.0; full_len] };
            }
            let (x, y, z) = out.coord;
            let mut params = out.params.clone();
            params.insert(fi, d_map[[x, y, z]]);
            if let Some(m) = t1_map { params.push(m[[x, y, z]]) }
            FitOutput { coord: out.coord, params }
        }).collect()
    }

    /// Evaluate reconstructed full-layout vectors (see `reconstruct_full`).
    pub fn evaluate(&self, outputs: &[FitOutput], results: &mut Results) -> Result<()> {
        results.eval_ivim(outputs, &self.full.b_values, self.full.n_components,
                          self.full.mixing_time, &self.full.grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ivim_signal;
    use float_eq::assert_float_eq;
    use ndarray::{Array3 as A3, Array4};

    fn params() -> IvimSegmentedParams {
        IvimSegmentedParams {
            full: IvimParams { n_components: 2, ..IvimParams::default() },
            fixed_component: FixedComponent::DSlow,
            fixed_t1: false,
            reduced_b_values: Some(vec![150., 200., 250., 300., 400., 525., 750.]),
        }
    }

    #[test]
    fn reduced_indices_locate_the_subset() {
        let p = params();
        assert_eq!(p.reduced_indices().unwrap(), vec![9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn foreign_reduced_b_value_is_rejected() {
        let mut p = params();
        p.reduced_b_values = Some(vec![150., 151.]);
        assert!(matches!(p.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn stage_one_is_mono_with_the_fixed_slot_bounds() {
        let p = params();
        let s1 = p.stage_one_params().unwrap();
        assert_eq!(s1.n_components, 1);
        assert_eq!(s1.b_values.len(), 7);
        let full = p.full.bounds();
        let b = s1.bounds();
        assert_eq!(b.lower, vec![full.lower[0], full.lower[3]]);
        assert_eq!(b.upper, vec![full.upper[0], full.upper[3]]);
        assert!(s1.validate().is_ok());
    }

    #[test]
    fn stage_one_args_slice_the_signals() {
        let p = params();
        let grid = VoxelGrid::new(Array4::from_shape_fn((1, 1, 1, 16), |(_, _, _, b)| b as f64));
        let mask = SegMask::new(A3::ones((1, 1, 1)));
        let args = p.stage_one_args(&grid, &mask).unwrap();
        assert_eq!(args[0].signal, vec![9., 10., 11., 12., 13., 14., 15.]);
    }

    #[test]
    fn stage_two_recovers_remaining_parameters() {
        let p = params();
        let (d_slow, d_fast, f_slow, s0) = (0.0012, 0.018, 0.55, 180.0);
        let b = &p.full.b_values;
        let signal = ivim_signal(b, &[d_slow, d_fast, f_slow, s0], 2, None);

        let fit = p.bind_stage_two_fit();
        let out = fit(&FitArg { coord: (0, 0, 0), signal, fixed: vec![d_slow] });
        assert_float_eq!(out.params[0], d_fast, rel <= 0.05);
        assert_float_eq!(out.params[1], f_slow, rel <= 0.05);
        assert_float_eq!(out.params[2], s0, rel <= 0.05);
    }

    #[test]
    fn reconstruction_reinserts_the_fixed_coefficient() {
        let p = params();
        let mut d_map = A3::zeros((1, 1, 1));
        d_map[[0, 0, 0]] = 0.0012;
        let stage2 = vec![FitOutput { coord: (0, 0, 0), params: vec![0.018, 0.55, 180.0] }];
        let full = p.reconstruct_full(&stage2, &d_map, None);
        assert_eq!(full[0].params, vec![0.0012, 0.018, 0.55, 180.0]);
    }

    #[test]
    fn failed_stage_two_voxel_stays_failed_after_reconstruction() {
        let p = params();
        let mut d_map = A3::zeros((1, 1, 1));
        d_map[[0, 0, 0]] = 0.0012;
        let stage2 = vec![FitOutput { coord: (0, 0, 0), params: vec![0.0; 3] }];

        let full = p.reconstruct_full(&stage2, &d_map, None);
        assert!(full[0].params.iter().all(|&v| v == 0.0));

        let mut results = Results::new((1, 1, 1), p.full.grid.n_bins);
        p.evaluate(&full, &mut results).unwrap();
        assert!(results.d[&(0, 0, 0)].is_empty());
        assert!(results.f[&(0, 0, 0)].is_empty());
        assert_eq!(results.s0[&(0, 0, 0)], 0.0);
    }

    #[test]
    fn t1_without_mixing_time_fails_validation() {
        let mut p = params();
        p.fixed_t1 = true;
        assert!(matches!(p.validate(), Err(Error::Config(_))));
        p.full.mixing_time = Some(50.0);
        assert!(p.validate().is_ok());
    }
}
