//! Interpretation and export of raw fit vectors.
//!
//! Every fit run populates the coordinate-keyed maps once per voxel (a
//! coordinate fitted twice keeps the last write) and writes a spectrum row
//! into the 4-D volume. Spectral fits read peaks off the solved weights;
//! parametric fits place unit impulses at the nearest diffusion bin.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::izip;
use ndarray::Array4;
use ordered_float::OrderedFloat;

use crate::model::{ivim_signal, spectral_curve};
use crate::params::{DiffusionGrid, FitOutput};
use crate::peaks::{find_peaks, width_half_max};
use crate::{io, Diffusionf64, Fractionf64, Intensityf64, Result, Voxel};

/// Diffusion-regime boundaries for the AUC aggregation, in mm²/s.
pub const AUC_BOUNDARIES: [f64; 3] = [0.003, 0.05, 0.3];

/// Scale to unit sum; an empty or all-zero vector passes through unchanged.
fn normalized(v: Vec<f64>) -> Vec<f64> {
    let total: f64 = v.iter().sum();
    if total > 0.0 {
        v.into_iter().map(|x| x / total).collect()
    } else {
        v
    }
}

/// How spectral peak heights become volume fractions. Both policies
/// normalize so detected fractions sum to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FractionPolicy {
    /// Peak heights; peaks below 0.1 are discarded first.
    Height,
    /// Area of the Gaussian matching each peak's height and width. No
    /// height cutoff: regularization already suppressed spurious peaks.
    GaussianArea,
}

impl FractionPolicy {
    fn min_height(self) -> f64 {
        match self {
            FractionPolicy::Height => 0.1,
            FractionPolicy::GaussianArea => 0.0,
        }
    }
}

pub struct Results {
    pub d: BTreeMap<Voxel, Vec<Diffusionf64>>,
    pub f: BTreeMap<Voxel, Vec<Fractionf64>>,
    pub s0: BTreeMap<Voxel, Intensityf64>,
    pub t1: BTreeMap<Voxel, f64>,
    pub curve: BTreeMap<Voxel, Vec<Intensityf64>>,
    pub raw: BTreeMap<Voxel, Vec<f64>>,
    spectrum: Array4<f64>,
}

impl Results {
    pub fn new(shape: (usize, usize, usize), n_bins: usize) -> Self {
        Self {
            d: BTreeMap::new(),
            f: BTreeMap::new(),
            s0: BTreeMap::new(),
            t1: BTreeMap::new(),
            curve: BTreeMap::new(),
            raw: BTreeMap::new(),
            spectrum: Array4::zeros((shape.0, shape.1, shape.2, n_bins)),
        }
    }

    pub fn spectrum(&self) -> &Array4<f64> { &self.spectrum }

    /// Read diffusion values and fractions off solved spectral weights.
    pub fn eval_spectral(
        &mut self,
        outputs: &[FitOutput],
        b_values: &[f64],
        grid: &DiffusionGrid,
        policy: FractionPolicy,
    ) -> Result<()> {
        let bins = grid.bins();
        for out in outputs {
            let weights = &out.params;
            let peaks = find_peaks(weights, policy.min_height());

            let d: Vec<f64> = peaks.iter().map(|p| bins[p.index]).collect();
            let f: Vec<f64> = match policy {
                FractionPolicy::Height => {
                    normalized(peaks.iter().map(|p| p.height).collect())
                }
                FractionPolicy::GaussianArea => {
                    let sigma_to_fwhm = 2.0 * (2.0 * 2.0_f64.ln()).sqrt();
                    normalized(peaks.iter().map(|&p| {
                        let fwhm = width_half_max(weights, p);
                        p.height * fwhm / sigma_to_fwhm * (2.0 * std::f64::consts::PI).sqrt()
                    }).collect())
                }
            };

            self.curve.insert(out.coord, spectral_curve(b_values, weights, &bins));
            self.d.insert(out.coord, d);
            self.f.insert(out.coord, f);
            self.raw.insert(out.coord, weights.clone());
            self.write_spectrum_row(out.coord, weights);
        }
        Ok(())
    }

    /// Unpack parametric vectors laid out as `[d.., f_1..f_{n-1}, S0, (T1)]`.
    pub fn eval_ivim(
        &mut self,
        outputs: &[FitOutput],
        b_values: &[f64],
        n_components: usize,
        mixing_time: Option<f64>,
        grid: &DiffusionGrid,
    ) -> Result<()> {
        for out in outputs {
            let p = &out.params;
            // A zero vector marks a solver failure for this voxel
            if p.iter().all(|&v| v == 0.0) {
                self.d.insert(out.coord, vec![]);
                self.f.insert(out.coord, vec![]);
                self.s0.insert(out.coord, 0.0);
                self.raw.insert(out.coord, p.clone());
                self.write_spectrum_row(out.coord, &vec![0.0; grid.n_bins]);
                continue;
            }
            let d = p[..n_components].to_vec();
            let mut f = p[n_components..2 * n_components - 1].to_vec();
            f.push(1.0 - f.iter().sum::<f64>());
            let s0 = p[2 * n_components - 1];

            self.curve.insert(out.coord, ivim_signal(b_values, p, n_components, mixing_time));
            if mixing_time.is_some() {
                self.t1.insert(out.coord, p[2 * n_components]);
            }

            let mut row = vec![0.0; grid.n_bins];
            for (&di, &fi) in d.iter().zip(&f) {
                row[grid.nearest_bin(di)] = fi;
            }
            self.write_spectrum_row(out.coord, &row);

            self.d.insert(out.coord, d);
            self.f.insert(out.coord, f);
            self.s0.insert(out.coord, s0);
            self.raw.insert(out.coord, p.clone());
        }
        Ok(())
    }

    // Segmentation-wise sentinel coordinates can lie outside the volume;
    // those results stay map-only.
    fn write_spectrum_row(&mut self, (x, y, z): Voxel, row: &[f64]) {
        let s = self.spectrum.shape();
        if x < s[0] && y < s[1] && z < s[2] {
            self.spectrum
                .slice_mut(ndarray::s![x, y, z, ..])
                .assign(&ndarray::ArrayView1::from(row));
        }
    }

    /// Aggregate each voxel's compartments into diffusion regimes.
    ///
    /// Regimes are the half-open intervals below each boundary, processed
    /// low to high; each compartment is consumed by the first regime whose
    /// boundary exceeds its coefficient. Per regime: fraction-weighted mean
    /// coefficient and summed fraction; `(0, 0)` where no compartment falls.
    pub fn auc_by_regime(&self, boundaries: &[f64]) -> BTreeMap<Voxel, Vec<(Diffusionf64, Fractionf64)>> {
        let mut by_voxel = BTreeMap::new();
        for (coord, d) in &self.d {
            let f = &self.f[coord];
            let mut compartments: Vec<(f64, f64)> =
                d.iter().copied().zip(f.iter().copied()).collect();
            compartments.sort_by_key(|&(di, _)| OrderedFloat(di));

            let mut regimes = Vec::with_capacity(boundaries.len());
            let mut next = 0;
            for &boundary in boundaries {
                let start = next;
                while next < compartments.len() && compartments[next].0 < boundary {
                    next += 1;
                }
                let slice = &compartments[start..next];
                let f_sum: f64 = slice.iter().map(|&(_, fi)| fi).sum();
                let d_auc = if f_sum > 0.0 {
                    slice.iter().map(|&(di, fi)| di * fi).sum::<f64>() / f_sum
                } else {
                    0.0
                };
                regimes.push((d_auc, f_sum));
            }
            by_voxel.insert(*coord, regimes);
        }
        by_voxel
    }

    /// One row per compartment, compartments numbered from 1, voxels in
    /// coordinate order: `(x, y, slice, compartment, d, f, n_compartments)`.
    pub fn rows(&self) -> Vec<(usize, usize, usize, usize, Diffusionf64, Fractionf64, usize)> {
        let mut rows = vec![];
        for (coord, d) in &self.d {
            let f = &self.f[coord];
            let n = d.len();
            for (i, (&di, &fi)) in izip!(d, f).enumerate() {
                rows.push((coord.0, coord.1, coord.2, i + 1, di, fi, n));
            }
        }
        rows
    }

    pub fn write_rows_csv(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "pixel_x,pixel_y,slice,compartment,D,f,n_compartments")?;
        for (x, y, z, c, d, f, n) in self.rows() {
            writeln!(out, "{x},{y},{z},{c},{d},{f},{n}")?;
        }
        Ok(())
    }

    pub fn write_spectrum_raw(&self, path: &Path) -> Result<()> {
        io::write_raw(self.spectrum.iter().copied(), path)?;
        Ok(())
    }
}
