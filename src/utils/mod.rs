//! Shared helpers for tensor conversion and raster filtering

pub mod preprocessing;
pub mod raster;

pub use preprocessing::ImagePreprocessor;
