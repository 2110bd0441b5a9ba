//! Small named calibration tables kept next to the datasets: virtual-channel
//! matrices and per-channel ratios.

pub mod matrix;
pub mod ratios;

pub use matrix::{denormalize, invert, normalize, Conversion, DerivedMatrix, MatrixView};
pub use ratios::ChannelRatios;
