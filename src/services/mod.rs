//! Services kept apart from the segmentation pipeline

pub mod format;

pub use format::OutputFormatHandler;
