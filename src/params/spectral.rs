//! Spectral (NNLS) parameter sets: plain, regularized with a fixed weight,
//! and regularized with per-voxel cross-validated weight.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{default_b_values, default_n_workers, DiffusionGrid, FitArg, FitFn, FitOutput};
use crate::model::nnls::{difference_matrix, nnls, nnls_reg_cv};
use crate::Result;

/// Plain NNLS decomposition over the diffusion grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpectralParams {
    pub b_values: Vec<f64>,
    pub grid: DiffusionGrid,
    pub max_iter: usize,
    pub n_workers: usize,
}

impl Default for SpectralParams {
    fn default() -> Self {
        Self {
            b_values: default_b_values(),
            grid: DiffusionGrid::default(),
            max_iter: 250,
            n_workers: default_n_workers(),
        }
    }
}

impl SpectralParams {
    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        if self.b_values.is_empty() {
            return Err(crate::Error::Config("no b-values configured".into()));
        }
        Ok(())
    }

    /// Decay basis `exp(-b_i * d_j)`, shape `(n_b, n_bins)`.
    pub fn basis(&self) -> Array2<f64> {
        let bins = self.grid.bins();
        Array2::from_shape_fn((self.b_values.len(), bins.len()),
                              |(i, j)| (-self.b_values[i] * bins[j]).exp())
    }

    pub(crate) fn bind(&self) -> FitFn {
        let basis = self.basis();
        let max_iter = self.max_iter;
        let n_bins = self.grid.n_bins;
        Box::new(move |arg: &FitArg| {
            let params = nnls(&basis, &arg.signal, max_iter)
                .unwrap_or_else(|| vec![0.0; n_bins]);
            FitOutput { coord: arg.coord, params }
        })
    }
}

/// NNLS with a banded difference penalty at a fixed weight `mu`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpectralRegParams {
    pub base: SpectralParams,
    pub reg_order: u8,
    pub mu: f64,
}

impl Default for SpectralRegParams {
    fn default() -> Self {
        Self {
            base: SpectralParams { max_iter: 250, ..SpectralParams::default() },
            reg_order: 2,
            mu: 0.02,
        }
    }
}

impl SpectralRegParams {
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        difference_matrix(self.reg_order, self.base.grid.n_bins)?;
        if self.mu < 0.0 {
            return Err(crate::Error::Config(format!(
                "regularization weight must be non-negative, got {}", self.mu
            )));
        }
        Ok(())
    }

    /// Decay basis with `mu`-scaled penalty rows appended. Signals must be
    /// zero-padded by `n_bins` to match.
    pub fn reg_basis(&self) -> Result<Array2<f64>> {
        let basis = self.base.basis();
        let penalty = difference_matrix(self.reg_order, self.base.grid.n_bins)?;
        let (m, n) = basis.dim();
        let mut stacked = Array2::zeros((m + n, n));
        stacked.slice_mut(ndarray::s![..m, ..]).assign(&basis);
        stacked.slice_mut(ndarray::s![m.., ..]).assign(&(&penalty * self.mu));
        Ok(stacked)
    }

    pub(crate) fn bind(&self) -> FitFn {
        // validate() has run by the time a fit is bound
        let basis = self.reg_basis().unwrap_or_else(|_| self.base.basis());
        let max_iter = self.base.max_iter;
        let n_bins = self.base.grid.n_bins;
        Box::new(move |arg: &FitArg| {
            let params = nnls(&basis, &arg.signal, max_iter)
                .unwrap_or_else(|| vec![0.0; n_bins]);
            FitOutput { coord: arg.coord, params }
        })
    }
}

/// NNLS with curvature penalty whose weight is cross-validated per voxel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpectralCvParams {
    pub base: SpectralParams,
    pub tol: f64,
}

impl Default for SpectralCvParams {
    fn default() -> Self {
        Self { base: SpectralParams::default(), tol: 1e-4 }
    }
}

impl SpectralCvParams {
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.tol <= 0.0 {
            return Err(crate::Error::Config(format!(
                "cross-validation tolerance must be positive, got {}", self.tol
            )));
        }
        Ok(())
    }

    pub(crate) fn bind(&self) -> FitFn {
        let basis = self.base.basis();
        let tol = self.tol;
        let max_iter = self.base.max_iter;
        let n_bins = self.base.grid.n_bins;
        Box::new(move |arg: &FitArg| {
            let params = nnls_reg_cv(&basis, &arg.signal, tol, max_iter)
                .unwrap_or_else(|| vec![0.0; n_bins]);
            FitOutput { coord: arg.coord, params }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    fn small() -> SpectralParams {
        SpectralParams {
            b_values: vec![0., 100., 400., 750.],
            grid: DiffusionGrid { n_bins: 5, d_range: (1e-3, 1e-1) },
            ..SpectralParams::default()
        }
    }

    #[test]
    fn basis_is_exponential_outer_product() {
        let p = small();
        let basis = p.basis();
        let bins = p.grid.bins();
        assert_eq!(basis.dim(), (4, 5));
        assert_float_eq!(basis[[0, 3]], 1.0, abs <= 1e-12); // b = 0 row
        assert_float_eq!(basis[[2, 1]], (-400.0 * bins[1]).exp(), rel <= 1e-12);
    }

    #[test]
    fn reg_basis_appends_scaled_penalty_rows() {
        let p = SpectralRegParams { base: small(), reg_order: 0, mu: 0.5 };
        let stacked = p.reg_basis().unwrap();
        assert_eq!(stacked.dim(), (4 + 5, 5));
        // Identity penalty scaled by mu
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 0.5 } else { 0.0 };
                assert_float_eq!(stacked[[4 + i, j]], expected, abs <= 1e-12);
            }
        }
    }

    #[test]
    fn invalid_reg_order_fails_validation() {
        let p = SpectralRegParams { base: small(), reg_order: 7, mu: 0.02 };
        assert!(p.validate().is_err());
    }

    #[test]
    fn bound_fit_recovers_single_compartment() {
        let p = small();
        let bins = p.grid.bins();
        let signal: Vec<f64> = p.b_values.iter().map(|&b| 2.0 * (-b * bins[2]).exp()).collect();
        let fit = p.bind();
        let out = fit(&FitArg { coord: (1, 2, 3), signal, fixed: vec![] });
        assert_eq!(out.coord, (1, 2, 3));
        let top = out.params.iter().enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1)).map(|(i, _)| i);
        assert_eq!(top, Some(2));
    }
}
