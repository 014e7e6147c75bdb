//! Crate-wide error type.
//!
//! Configuration and shape-contract violations are fatal and surface before
//! any fitting work is dispatched. Per-voxel numerical failures are *not*
//! errors: the bound fit functions convert them into zero-vector results.

#[derive(Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or inconsistent fitting configuration.
    Config(String),
    /// Image / mask / b-value dimensions violate the shape contract.
    Shape(String),
    /// A fit was requested without the data it needs.
    MissingInput(String),
    /// Filesystem or parse failure while loading external inputs.
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config      (msg) => write!(f, "configuration error: {msg}"),
            Error::Shape       (msg) => write!(f, "shape mismatch: {msg}"),
            Error::MissingInput(msg) => write!(f, "missing input: {msg}"),
            Error::Io          (msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self { Error::Io(e.to_string()) }
}
