//! Parametric IVIM fitting: mono-, bi- or tri-exponential decay with an
//! optional T1 term, solved by bounded least squares per voxel.

use serde::{Deserialize, Serialize};

use super::{default_b_values, default_n_workers, Boundaries, DiffusionGrid, FitArg, FitFn, FitOutput};
use crate::model::{ivim_signal, lsq::curve_fit};
use crate::{Error, Result};

// Component-count-dependent boundary defaults, slow to fast.
const X0_D: [f64; 3] = [0.0005, 0.01, 0.1];
const LB_D: [f64; 3] = [0.0001, 0.003, 0.02];
const UB_D: [f64; 3] = [0.003, 0.02, 0.4];
const X0_F: [f64; 2] = [0.3, 0.5];
const LB_F: [f64; 2] = [0.01, 0.01];
const UB_F: [f64; 2] = [0.7, 0.7];
const X0_S0: f64 = 210.0;
const LB_S0: f64 = 10.0;
const UB_S0: f64 = 10_000.0;
const X0_T1: f64 = 1750.0;
const LB_T1: f64 = 1000.0;
const UB_T1: f64 = 2500.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IvimParams {
    pub b_values: Vec<f64>,
    pub n_components: usize,
    /// Mixing time of the acquisition; set it to also fit a T1 term.
    pub mixing_time: Option<f64>,
    /// `None` selects the component-count-dependent defaults.
    pub boundaries: Option<Boundaries>,
    /// Grid used only to reconstruct a spectrum from the fitted components.
    pub grid: DiffusionGrid,
    pub max_iter: usize,
    pub n_workers: usize,
}

impl Default for IvimParams {
    fn default() -> Self {
        Self {
            b_values: default_b_values(),
            n_components: 2,
            mixing_time: None,
            boundaries: None,
            grid: DiffusionGrid::default(),
            max_iter: 600,
            n_workers: default_n_workers(),
        }
    }
}

impl IvimParams {
    /// Parameter vector layout: `[d_1..d_n, f_1..f_{n-1}, S0]` plus a
    /// trailing T1 when a mixing time is set.
    pub fn n_free(&self) -> usize {
        2 * self.n_components + usize::from(self.mixing_time.is_some())
    }

    /// Change the component count and drop any custom boundaries, so the
    /// defaults for the new count take effect as one step.
    pub fn set_component_count(&mut self, n: usize) -> Result<()> {
        if !(1..=3).contains(&n) {
            return Err(Error::Config(format!("component count must be 1..=3, got {n}")));
        }
        self.n_components = n;
        self.boundaries = None;
        Ok(())
    }

    pub fn default_boundaries(n_components: usize, with_t1: bool) -> Boundaries {
        let n = n_components;
        let collect = |d: &[f64], f: &[f64], s0: f64, t1: f64| {
            let mut v: Vec<f64> = d[..n].to_vec();
            v.extend_from_slice(&f[..n - 1]);
            v.push(s0);
            if with_t1 { v.push(t1) }
            v
        };
        Boundaries {
            lower: collect(&LB_D, &LB_F, LB_S0, LB_T1),
            start: collect(&X0_D, &X0_F, X0_S0, X0_T1),
            upper: collect(&UB_D, &UB_F, UB_S0, UB_T1),
        }
    }

    /// The boundaries in force: the configured ones, or the defaults for the
    /// current component count.
    pub fn bounds(&self) -> Boundaries {
        self.boundaries.clone().unwrap_or_else(|| {
            Self::default_boundaries(self.n_components, self.mixing_time.is_some())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.n_components) {
            return Err(Error::Config(format!(
                "component count must be 1..=3, got {}", self.n_components
            )));
        }
        if self.b_values.is_empty() {
            return Err(Error::Config("no b-values configured".into()));
        }
        if let Some(tm) = self.mixing_time {
            if tm <= 0.0 {
                return Err(Error::Config(format!("mixing time must be positive, got {tm}")));
            }
        }
        self.grid.validate()?;
        let bounds = self.bounds();
        bounds.validate()?;
        if bounds.len() != self.n_free() {
            return Err(Error::Config(format!(
                "boundaries carry {} parameters but the model has {}",
                bounds.len(), self.n_free()
            )));
        }
        Ok(())
    }

    pub(crate) fn bind(&self) -> FitFn {
        let b_values = self.b_values.clone();
        let bounds = self.bounds();
        let n_components = self.n_components;
        let mixing_time = self.mixing_time;
        let max_iter = self.max_iter;
        let n_free = self.n_free();
        Box::new(move |arg: &FitArg| {
            let signal = &arg.signal;
            let residuals = |p: &[f64]| -> Vec<f64> {
                ivim_signal(&b_values, p, n_components, mixing_time)
                    .iter().zip(signal)
                    .map(|(model, s)| model - s)
                    .collect()
            };
            let params = curve_fit(residuals, &bounds.start, &bounds.lower, &bounds.upper, max_iter)
                .unwrap_or_else(|| vec![0.0; n_free]);
            FitOutput { coord: arg.coord, params }
        })
    }
}
