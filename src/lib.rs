mod exports;
pub use exports::*;

pub mod error;
pub mod image;
pub mod io;
pub mod utils;
pub mod peaks;
pub mod dispatch;
pub mod model;
pub mod params;
pub mod config;
pub mod results;
pub mod fitdata;
