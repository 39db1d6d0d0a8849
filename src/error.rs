//! Module containing the universal error type
use crate::settings::Algorithm;
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("meshing was cancelled")]
    Cancelled,

    #[error("`min_feature` must be positive and finite, not {0}")]
    BadMinFeature(f32),

    #[error("at least one worker is required")]
    NoWorkers,

    #[error("the region must have positive extent on every axis")]
    EmptyRegion,

    #[error("{0:?} meshing is not implemented")]
    UnsupportedAlgorithm(Algorithm),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
