//! End-to-end properties of the fitting engine: dispatch invariants,
//! parameter recovery on synthetic volumes, and the segmented hand-off.

use std::collections::BTreeSet;

use float_eq::assert_float_eq;
use ndarray::{Array3, Array4};
use proptest::prelude::*;
use rstest::rstest;

use dwifit::model::ivim_signal;
use dwifit::params::{
    DiffusionGrid, FitParams, FixedComponent, IvimParams, IvimSegmentedParams, SpectralParams,
};
use dwifit::{FitData, SegMask, VoxelGrid};

const B16: [f64; 16] = [0., 5., 10., 20., 30., 40., 50., 75., 100., 150., 200., 250., 300., 400., 525., 750.];

fn biexp_volume(shape: (usize, usize, usize)) -> VoxelGrid {
    let (d_slow, d_fast, f_slow, s0) = (0.001, 0.02, 0.6, 200.0);
    let signal = ivim_signal(&B16, &[d_slow, d_fast, f_slow, s0], 2, None);
    VoxelGrid::new(Array4::from_shape_fn(
        (shape.0, shape.1, shape.2, 16),
        |(_, _, _, b)| signal[b],
    ))
}

fn full_mask(shape: (usize, usize, usize)) -> SegMask {
    SegMask::new(Array3::ones(shape))
}

fn spectral_params(n_workers: usize) -> FitParams {
    FitParams::Spectral(SpectralParams {
        b_values: B16.to_vec(),
        grid: DiffusionGrid { n_bins: 40, d_range: (1e-4, 2e-1) },
        n_workers,
        ..SpectralParams::default()
    })
}

#[rstest(n_workers, case(0), case(1), case(4))]
fn every_masked_voxel_is_fitted_exactly_once(n_workers: usize) {
    let shape = (3, 2, 2);
    let data = FitData::new(biexp_volume(shape), full_mask(shape), spectral_params(n_workers))
        .unwrap();
    let results = data.fit_pixel_wise().unwrap();

    let expected: BTreeSet<_> = data.mask().nonzero_voxels().into_iter().collect();
    let fitted: BTreeSet<_> = results.d.keys().copied().collect();
    assert_eq!(fitted, expected);
}

#[test]
fn parallel_and_sequential_runs_agree() {
    let shape = (2, 2, 2);
    let seq = FitData::new(biexp_volume(shape), full_mask(shape), spectral_params(0))
        .unwrap().fit_pixel_wise().unwrap();
    let par = FitData::new(biexp_volume(shape), full_mask(shape), spectral_params(4))
        .unwrap().fit_pixel_wise().unwrap();
    assert_eq!(seq.raw, par.raw);
    assert_eq!(seq.d, par.d);
}

#[test]
fn biexponential_parameters_are_recovered_within_five_percent() {
    let shape = (2, 2, 2);
    let params = FitParams::Ivim(IvimParams {
        b_values: B16.to_vec(),
        n_components: 2,
        n_workers: 0,
        ..IvimParams::default()
    });
    let data = FitData::new(biexp_volume(shape), full_mask(shape), params).unwrap();
    let results = data.fit_pixel_wise().unwrap();

    for (_, d) in &results.d {
        assert_float_eq!(d[0], 0.001, rel <= 0.05);
        assert_float_eq!(d[1], 0.02, rel <= 0.05);
    }
    for (_, f) in &results.f {
        assert_float_eq!(f[0], 0.6, rel <= 0.05);
        assert_float_eq!(f.iter().sum::<f64>(), 1.0, abs <= 1e-9);
    }
    for (_, &s0) in &results.s0 {
        assert_float_eq!(s0, 200.0, rel <= 0.05);
    }
}

#[test]
fn noisy_biexponential_recovery_stays_close() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(7);

    let clean = ivim_signal(&B16, &[0.001, 0.02, 0.6, 200.0], 2, None);
    let img = Array4::from_shape_fn((1, 1, 1, 16), |(_, _, _, b)| {
        clean[b] + rng.gen_range(-0.5..0.5)
    });
    let params = FitParams::Ivim(IvimParams {
        b_values: B16.to_vec(),
        n_components: 2,
        n_workers: 0,
        ..IvimParams::default()
    });
    let data = FitData::new(VoxelGrid::new(img), full_mask((1, 1, 1)), params).unwrap();
    let results = data.fit_pixel_wise().unwrap();

    let d = &results.d[&(0, 0, 0)];
    assert_float_eq!(d[0], 0.001, rel <= 0.1);
    assert_float_eq!(d[1], 0.02, rel <= 0.1);
    assert_float_eq!(results.f[&(0, 0, 0)][0], 0.6, rel <= 0.1);
}

#[test]
fn segmented_fit_keeps_the_stage_one_coefficient() {
    let shape = (2, 1, 1);
    let params = IvimSegmentedParams {
        full: IvimParams {
            b_values: B16.to_vec(),
            n_components: 2,
            n_workers: 0,
            ..IvimParams::default()
        },
        fixed_component: FixedComponent::DSlow,
        fixed_t1: false,
        reduced_b_values: Some(vec![150., 200., 250., 300., 400., 525., 750.]),
    };

    let grid = biexp_volume(shape);
    let mask = full_mask(shape);

    // Run stage 1 by hand to know what coefficient got pinned per voxel
    let stage_one = params.stage_one_params().unwrap();
    let args = params.stage_one_args(&grid, &mask).unwrap();
    let fit = FitParams::Ivim(stage_one).bind_fit_function().unwrap();
    let (d_map, _) = params.fixed_maps(
        &dwifit::dispatch::fit_all(&fit, &args, 0).unwrap(),
        mask.shape(),
    );

    let data = FitData::new(grid, mask, FitParams::IvimSegmented(params)).unwrap();
    let results = data.fit_segmented().unwrap();

    for (coord, d) in &results.d {
        assert_eq!(d[0], d_map[[coord.0, coord.1, coord.2]]);
        // Stage 1 sees mostly the slow compartment on the high-b subset
        assert_float_eq!(d[0], 0.001, rel <= 0.3);
        assert_float_eq!(d[1], 0.02, rel <= 0.2);
    }
}

#[test]
fn spectral_fit_places_the_peak_at_the_simulated_coefficient() {
    let n_bins = 60;
    let grid_spec = DiffusionGrid { n_bins, d_range: (1e-4, 2e-1) };
    let bins = grid_spec.bins();
    let d_true = bins[25];

    let img = Array4::from_shape_fn((1, 1, 1, 16), |(_, _, _, b)| {
        150.0 * (-B16[b] * d_true).exp()
    });
    let params = FitParams::Spectral(SpectralParams {
        b_values: B16.to_vec(),
        grid: grid_spec,
        n_workers: 0,
        ..SpectralParams::default()
    });
    let data = FitData::new(VoxelGrid::new(img), full_mask((1, 1, 1)), params).unwrap();
    let results = data.fit_pixel_wise().unwrap();

    let d = &results.d[&(0, 0, 0)];
    assert!(!d.is_empty());
    // The dominant compartment lands on or next to the simulated bin
    let closest = d.iter().map(|&di| (di / d_true).ln().abs()).fold(f64::INFINITY, f64::min);
    let bin_step = (bins[1] / bins[0]).ln();
    assert!(closest <= 2.0 * bin_step, "no compartment near {d_true}");
}

proptest! {
    // Whatever the mask pattern and worker count, the fitted coordinate set
    // equals the nonzero-mask set.
    #[test]
    fn fitted_coordinates_match_the_mask(
        pattern in proptest::collection::vec(0u32..3, 8),
        n_workers in 0usize..5,
    ) {
        prop_assume!(pattern.iter().any(|&l| l != 0));
        let mask = SegMask::new(Array3::from_shape_vec((2, 2, 2), pattern).unwrap());
        let data = FitData::new(biexp_volume((2, 2, 2)), mask, spectral_params(n_workers))
            .unwrap();
        let results = data.fit_pixel_wise().unwrap();

        let expected: BTreeSet<_> = data.mask().nonzero_voxels().into_iter().collect();
        let fitted: BTreeSet<_> = results.d.keys().copied().collect();
        prop_assert_eq!(fitted, expected);
    }
}
