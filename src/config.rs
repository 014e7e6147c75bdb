//! JSON persistence of fit parameters.
//!
//! The `Class` field names the method variant; every other key belongs to
//! that variant's parameter set. Unknown classes and unknown keys are
//! configuration errors, as is any file that fails semantic validation.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::params::FitParams;
use crate::{Error, Result};

pub fn save_json(params: &FitParams, path: &Path) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| Error::Io(format!("cannot create parameter file {path:?}: {e}")))?;
    serde_json::to_writer_pretty(BufWriter::new(file), params)
        .map_err(|e| Error::Config(format!("cannot serialize parameters: {e}")))
}

pub fn load_json(path: &Path) -> Result<FitParams> {
    let file = File::open(path)
        .map_err(|e| Error::Io(format!("cannot open parameter file {path:?}: {e}")))?;
    let params: FitParams = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::Config(format!("invalid parameter file {path:?}: {e}")))?;
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::*;
    use rstest::rstest;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    fn roundtrip(params: FitParams) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        save_json(&params, &path).unwrap();
        assert_eq!(load_json(&path).unwrap(), params);
    }

    #[rstest(params,
             case(FitParams::Spectral(SpectralParams::default())),
             case(FitParams::SpectralReg(SpectralRegParams::default())),
             case(FitParams::SpectralCv(SpectralCvParams::default())),
             case(FitParams::Ivim(IvimParams::default())),
             case(FitParams::IvimSegmented(IvimSegmentedParams::default())),
    )]
    fn every_class_roundtrips(params: FitParams) {
        roundtrip(params);
    }

    #[test]
    fn customized_parameters_roundtrip() {
        roundtrip(FitParams::SpectralReg(SpectralRegParams {
            base: SpectralParams {
                b_values: vec![0., 50., 250., 750.],
                grid: DiffusionGrid { n_bins: 100, d_range: (5e-4, 1e-1) },
                max_iter: 300,
                n_workers: 8,
            },
            reg_order: 3,
            mu: 0.05,
        }));
        roundtrip(FitParams::IvimSegmented(IvimSegmentedParams {
            full: IvimParams { n_components: 3, ..IvimParams::default() },
            fixed_component: FixedComponent::DSlow,
            fixed_t1: false,
            reduced_b_values: Some(vec![150., 750.]),
        }));
    }

    #[test]
    fn unknown_class_fails_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"Class": "Quantum"}"#).unwrap();
        assert!(matches!(load_json(&path), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_key_fails_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"Class": "Spectral", "smoothing": 3}"#).unwrap();
        assert!(matches!(load_json(&path), Err(Error::Config(_))));
    }

    #[test]
    fn semantically_invalid_file_fails_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"Class": "SpectralReg", "reg_order": 9}"#).unwrap();
        assert!(matches!(load_json(&path), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(load_json(Path::new("/nonexistent/params.json")),
                         Err(Error::Io(_))));
    }
}
