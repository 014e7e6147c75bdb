//! Signal-decay models: multi-exponential IVIM evaluation and the spectral
//! forward curve. The solvers live in the submodules.

pub mod lsq;
pub mod nnls;

/// Evaluate the IVIM multi-exponential at every b-value.
///
/// Parameter layout: `[d_1 .. d_n, f_1 .. f_{n-1}, S0]`, with `[.., T1]`
/// appended when `mixing_time` is set. The last compartment's fraction is
/// implied as `1 - sum(f)`.
pub fn ivim_signal(
    b_values: &[f64],
    params: &[f64],
    n_components: usize,
    mixing_time: Option<f64>,
) -> Vec<f64> {
    let d = &params[..n_components];
    let f = &params[n_components..2 * n_components - 1];
    let s0 = params[2 * n_components - 1];
    let relax = match mixing_time {
        Some(tm) => (-params[2 * n_components] / tm).exp(),
        None => 1.0,
    };

    let f_last = 1.0 - f.iter().sum::<f64>();
    b_values.iter().map(|&b| {
        let decay: f64 = d.iter().zip(f.iter().chain(std::iter::once(&f_last)))
            .map(|(&di, &fi)| fi * (-b * di).exp())
            .sum();
        s0 * decay * relax
    }).collect()
}

/// IVIM evaluation with one compartment's decay coefficient held constant.
///
/// `free` carries the remaining parameters in the `ivim_signal` layout with
/// the fixed `d` removed: `[d_.., f_1 .. f_{n-1}, S0]`. When `t1_tm` is set,
/// the T1 value was also fixed per voxel and contributes
/// `exp(-t1 / mixing_time)`.
pub fn ivim_fixed_signal(
    b_values: &[f64],
    free: &[f64],
    fixed_index: usize,
    d_fixed: f64,
    t1_tm: Option<(f64, f64)>,
    n_components: usize,
) -> Vec<f64> {
    let mut d = Vec::with_capacity(n_components);
    d.extend_from_slice(&free[..n_components - 1]);
    d.insert(fixed_index, d_fixed);

    let f = &free[n_components - 1..2 * n_components - 2];
    let s0 = free[2 * n_components - 2];
    let relax = match t1_tm {
        Some((t1, tm)) => (-t1 / tm).exp(),
        None => 1.0,
    };

    let f_last = 1.0 - f.iter().sum::<f64>();
    b_values.iter().map(|&b| {
        let decay: f64 = d.iter().zip(f.iter().chain(std::iter::once(&f_last)))
            .map(|(&di, &fi)| fi * (-b * di).exp())
            .sum();
        s0 * decay * relax
    }).collect()
}

/// Forward curve of a fitted spectrum: `sum_j w_j exp(-b d_j)` at every
/// b-value, using the unregularized basis.
pub fn spectral_curve(b_values: &[f64], weights: &[f64], bins: &[f64]) -> Vec<f64> {
    b_values.iter().map(|&b| {
        weights.iter().zip(bins)
            .map(|(&w, &d)| w * (-b * d).exp())
            .sum()
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    const B: [f64; 5] = [0.0, 50.0, 200.0, 400.0, 750.0];

    #[test]
    fn mono_exponential_is_plain_decay() {
        let signal = ivim_signal(&B, &[0.0017, 180.0], 1, None);
        for (s, &b) in signal.iter().zip(&B) {
            assert_float_eq!(*s, 180.0 * (-b * 0.0017).exp(), rel <= 1e-12);
        }
    }

    #[test]
    fn fractions_sum_to_one_via_implied_last() {
        // At b = 0 every exponential is 1, so the signal must equal S0
        // regardless of the fraction split.
        let signal = ivim_signal(&[0.0], &[0.001, 0.02, 0.6, 150.0], 2, None);
        assert_float_eq!(signal[0], 150.0, rel <= 1e-12);
    }

    #[test]
    fn t1_term_attenuates_uniformly() {
        let plain = ivim_signal(&B, &[0.0017, 180.0], 1, None);
        let with_t1 = ivim_signal(&B, &[0.0017, 180.0, 1750.0], 1, Some(50.0));
        let factor = (-1750.0_f64 / 50.0).exp();
        for (p, t) in plain.iter().zip(&with_t1) {
            assert_float_eq!(*t, p * factor, rel <= 1e-12);
        }
    }

    #[test]
    fn fixed_component_matches_full_model() {
        // Bi-exponential with the slow coefficient pinned must agree with
        // the full model evaluated at the same parameters.
        let (d_slow, d_fast, f_slow, s0) = (0.001, 0.02, 0.6, 150.0);
        let full = ivim_signal(&B, &[d_slow, d_fast, f_slow, s0], 2, None);
        let fixed = ivim_fixed_signal(&B, &[d_fast, f_slow, s0], 0, d_slow, None, 2);
        for (a, b) in full.iter().zip(&fixed) {
            assert_float_eq!(*a, *b, rel <= 1e-12);
        }
    }

    #[test]
    fn spectral_curve_of_unit_impulse_is_single_exponential() {
        let bins = [0.0005, 0.0017, 0.05];
        let mut w = [0.0; 3];
        w[1] = 2.5;
        let curve = spectral_curve(&B, &w, &bins);
        for (c, &b) in curve.iter().zip(&B) {
            assert_float_eq!(*c, 2.5 * (-b * 0.0017).exp(), rel <= 1e-12);
        }
    }
}
