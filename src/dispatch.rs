//! Fan a bound fit function out over the work items.

use rayon::prelude::*;

use crate::params::{FitArg, FitFn, FitOutput};
use crate::{Error, Result};

/// Run `fit` over every argument. `n_workers == 0` runs on the calling
/// thread in input order; `n_workers > 0` builds a pool of exactly that many
/// threads, and the output order is unspecified. Either way the output
/// contains exactly one entry per input; consumers re-key by coordinate.
///
/// Requesting more workers than cores is allowed; it only costs scheduling
/// overhead.
pub fn fit_all(fit: &FitFn, args: &[FitArg], n_workers: usize) -> Result<Vec<FitOutput>> {
    if n_workers == 0 {
        return Ok(args.iter().map(fit).collect());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .build()
        .map_err(|e| Error::Config(format!("cannot build {n_workers}-thread pool: {e}")))?;
    Ok(pool.install(|| args.par_iter().map(fit).collect()))
}
