//! Box-constrained Levenberg-Marquardt for the parametric decay models.
//!
//! The Jacobian is formed by forward differences and the damped normal
//! equations are solved by Cholesky factorization. Iterates are clamped to
//! the `[lower, upper]` box after every accepted step.

use nalgebra::{DMatrix, DVector};

const CONV_TOL: f64 = 1e-8;
const DIFF_STEP: f64 = 1e-6;

/// Minimize `||residuals(x)||²` starting from `x0`, subject to
/// `lower <= x <= upper` componentwise.
///
/// Returns `None` when the solver breaks down numerically (non-finite
/// residuals at the start, or no solvable step ever found). Exhausting
/// `max_iter` returns the best iterate found so far.
pub fn curve_fit<F>(
    residuals: F,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    max_iter: usize,
) -> Option<Vec<f64>>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let np = x0.len();
    debug_assert_eq!(lower.len(), np);
    debug_assert_eq!(upper.len(), np);

    let mut x: Vec<f64> = x0.iter()
        .zip(lower.iter().zip(upper))
        .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
        .collect();

    let r = residuals(&x);
    if r.iter().any(|v| !v.is_finite()) { return None }
    let mut cost = sq_norm(&r);
    let mut r = DVector::from_vec(r);

    let mut lambda = 1e-3_f64;
    let mut nu = 2.0_f64;
    let mut made_any_step = false;

    for _ in 0..max_iter {
        let jac = jacobian(&residuals, &x, &r, lower, upper);

        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        // Damped normal equations, Marquardt diagonal scaling
        let mut damped = jtj.clone();
        for i in 0..np {
            damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
        }

        let delta = match damped.cholesky() {
            Some(chol) => chol.solve(&(-&jtr)),
            None => {
                lambda *= nu;
                nu *= 2.0;
                continue;
            }
        };

        let x_new: Vec<f64> = x.iter().enumerate()
            .map(|(i, &v)| (v + delta[i]).clamp(lower[i], upper[i]))
            .collect();

        let r_new = residuals(&x_new);
        if r_new.iter().any(|v| !v.is_finite()) {
            lambda *= nu;
            nu *= 2.0;
            continue;
        }
        let cost_new = sq_norm(&r_new);

        // Nielsen gain ratio against the damped quadratic model
        let predicted: f64 = (0..np)
            .map(|i| delta[i] * (lambda * jtj[(i, i)].max(1e-12) * delta[i] - jtr[i]))
            .sum();

        if predicted > 0.0 && cost_new < cost {
            let rho = (cost - cost_new) / predicted;
            let step_norm = sq_norm_slice(delta.as_slice()).sqrt();
            let x_norm = sq_norm_slice(&x).sqrt();

            x = x_new;
            cost = cost_new;
            r = DVector::from_vec(r_new);
            made_any_step = true;

            lambda *= (1.0_f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
            nu = 2.0;

            if step_norm < CONV_TOL * x_norm.max(1.0) {
                return Some(x);
            }
        } else {
            lambda *= nu;
            nu *= 2.0;
            if lambda > 1e12 {
                // Stuck: either converged onto a bound or the problem is
                // degenerate for this voxel.
                return if made_any_step || cost < CONV_TOL { Some(x) } else { None };
            }
        }
    }

    Some(x)
}

/// Forward-difference Jacobian of the residual vector. Parameters sitting at
/// their upper bound are probed backwards so the sample stays in the box.
fn jacobian<F>(
    residuals: &F,
    x: &[f64],
    r0: &DVector<f64>,
    lower: &[f64],
    upper: &[f64],
) -> DMatrix<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let np = x.len();
    let nr = r0.len();
    let mut jac = DMatrix::zeros(nr, np);
    let mut probe = x.to_vec();

    for j in 0..np {
        let mut h = DIFF_STEP * x[j].abs().max(1.0);
        if x[j] + h > upper[j] { h = -h }
        if x[j] + h < lower[j] { h = -h }
        probe[j] = x[j] + h;
        let r_probe = residuals(&probe);
        probe[j] = x[j];
        for i in 0..nr {
            jac[(i, j)] = (r_probe[i] - r0[i]) / h;
        }
    }
    jac
}

fn sq_norm(v: &[f64]) -> f64 { v.iter().map(|x| x * x).sum() }
fn sq_norm_slice(v: &[f64]) -> f64 { sq_norm(v) }
