//! Read / write float arrays as raw binary, and load b-value files.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::{Error, Result};

pub fn write_raw(data: impl Iterator<Item = f64>, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut buf = BufWriter::new(file);
    for datum in data {
        buf.write_all(&datum.to_le_bytes())?;
    }
    Ok(())
}

type IORes<T> = std::io::Result<T>;
pub fn read_raw(path: &Path) -> IORes<impl Iterator<Item = IORes<f64>>> {
    let file = File::open(path)?;
    let mut buf = BufReader::new(file);
    let mut buffer = [0; 8];

    Ok(std::iter::from_fn(move || {
        use std::io::ErrorKind::UnexpectedEof;
        match buf.read_exact(&mut buffer) {
            Ok(()) => Some(Ok(f64::from_le_bytes(buffer))),
            Err(e) if e.kind() == UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }))
}

/// Load a b-value file: newline-separated integers, one per decay sample.
pub fn load_b_values(path: &Path) -> Result<Vec<f64>> {
    let file = File::open(path)
        .map_err(|e| Error::Io(format!("cannot open b-value file {path:?}: {e}")))?;
    let mut b_values = vec![];
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() { continue }
        let b: i64 = line.parse()
            .map_err(|_| Error::Config(format!("b-value file line {}: `{line}` is not an integer", n + 1)))?;
        b_values.push(b as f64);
    }
    if b_values.is_empty() {
        return Err(Error::Config(format!("b-value file {path:?} contains no values")));
    }
    Ok(b_values)
}
