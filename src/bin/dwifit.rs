/// Command line interface for `dwifit`: fit a decay model to a raw DWI
/// volume and export the results.
#[derive(clap::Parser, Debug, Clone)]
#[clap(
    name = "dwifit",
    about = "Multi-compartment signal-decay fitting for DWI volumes",
)]
pub struct Cli {
    /// Fit parameter file (JSON, `Class`-tagged)
    #[clap(short, long)]
    pub config: PathBuf,

    /// Raw little-endian f64 image volume
    #[clap(short, long)]
    pub image: PathBuf,

    /// Image shape as X,Y,Z,B
    #[clap(short, long, value_parser = shape_from_str)]
    pub shape: (usize, usize, usize, usize),

    /// Raw little-endian f64 mask volume, labels stored as whole numbers,
    /// spatial shape matching the image
    #[clap(short, long)]
    pub mask: PathBuf,

    /// Fit one mean signal per segmentation label instead of per voxel
    #[clap(long)]
    pub segmentation_wise: bool,

    /// Override the configured b-values (newline-separated integers)
    #[clap(short, long)]
    pub b_values: Option<PathBuf>,

    /// Output CSV with one row per voxel and compartment
    #[clap(short, long)]
    pub out_csv: PathBuf,

    /// Also write the reconstructed spectrum volume as raw f64
    #[clap(long)]
    pub out_spectrum: Option<PathBuf>,

    /// Override the configured worker count (0 = run on this thread)
    #[clap(short = 'j', long)]
    pub workers: Option<usize>,
}

// ----- Imports -----------------------------------------------------------------
use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array3, Array4};

use dwifit::{
    config, dispatch, io,
    params::FitParams,
    utils::{group_digits, parse_shape4, timing::Progress},
    FitData, Results, SegMask, VoxelGrid,
};

fn shape_from_str(s: &str) -> Result<(usize, usize, usize, usize), String> {
    parse_shape4(s).map_err(|e| e.to_string())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut progress = Progress::new();

    progress.start("Loading fit parameters");
    let mut params = config::load_json(&cli.config)?;
    if let Some(path) = &cli.b_values {
        params.set_b_values(io::load_b_values(path)?);
    }
    if let Some(n) = cli.workers {
        params.set_n_workers(n);
    }
    params.validate()?;
    progress.done();

    progress.start("Loading image and mask");
    let (x, y, z, b) = cli.shape;
    let grid = load_image(&cli.image, (x, y, z, b))?;
    let mask = load_mask(&cli.mask, (x, y, z))?;
    progress.done();

    let data = FitData::new(grid, mask, params)?;
    let n_voxels = data.mask().nonzero_voxels().len();
    println!("Fitting {} voxels with {} workers",
             group_digits(n_voxels), data.params.n_workers());

    let results = if matches!(data.params, FitParams::IvimSegmented(_)) {
        let spinner = ProgressBar::new_spinner().with_message("two-stage segmented fit");
        spinner.enable_steady_tick(std::time::Duration::from_millis(100));
        let results = data.fit_segmented()?;
        spinner.finish();
        results
    } else {
        fit_with_bar(&data, cli.segmentation_wise)?
    };
    progress.done_with_message("Fitted");

    results.write_rows_csv(&cli.out_csv)?;
    if let Some(path) = &cli.out_spectrum {
        results.write_spectrum_raw(path)?;
    }
    progress.done_with_message("Wrote results");

    Ok(())
}

/// Pixel- or segmentation-wise fit with a progress bar ticking per work item.
fn fit_with_bar(data: &FitData, segmentation_wise: bool) -> Result<Results, Box<dyn Error>> {
    let args = if segmentation_wise {
        data.params.seg_args(data.grid(), data.mask())?
    } else {
        data.params.pixel_args(data.grid(), data.mask())?
    };

    let bar = ProgressBar::new(args.len() as u64).with_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} voxels ({eta})")?,
    );

    let fit = data.params.bind_fit_function()?;
    let ticking = bar.clone();
    let fit: dwifit::params::FitFn = Box::new(move |arg| {
        let out = fit(arg);
        ticking.inc(1);
        out
    });

    let outputs = dispatch::fit_all(&fit, &args, data.params.n_workers())?;
    bar.finish();

    let (x, y, z, _) = data.grid().shape();
    let mut results = Results::new((x, y, z), data.params.spectrum_bins());
    data.params.evaluate(&outputs, &mut results)?;
    Ok(results)
}

fn load_image(path: &PathBuf, shape: (usize, usize, usize, usize)) -> Result<VoxelGrid, Box<dyn Error>> {
    let data: Vec<f64> = io::read_raw(path)?.collect::<std::io::Result<_>>()?;
    let array = Array4::from_shape_vec(shape, data)
        .map_err(|e| format!("image does not match shape {shape:?}: {e}"))?;
    Ok(VoxelGrid::new(array))
}

fn load_mask(path: &PathBuf, shape: (usize, usize, usize)) -> Result<SegMask, Box<dyn Error>> {
    let data: Vec<f64> = io::read_raw(path)?.collect::<std::io::Result<_>>()?;
    let labels: Vec<u32> = data.into_iter().map(|v| v as u32).collect();
    let array = Array3::from_shape_vec(shape, labels)
        .map_err(|e| format!("mask does not match shape {shape:?}: {e}"))?;
    Ok(SegMask::new(array))
}
