//! Crate-wide error type.

use std::path::PathBuf;

/// Errors returned by the trunkmap pipeline.
#[derive(thiserror::Error, Debug)]
pub enum TrunkmapError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),
    #[error(transparent)]
    Png(#[from] png::DecodingError),
    /// Crop name does not follow `<base>_<x>_<y>.<ext>`.
    #[error("malformed crop name '{name}': {reason}")]
    MalformedCropName { name: String, reason: &'static str },
    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("no reference image (.tif/.tiff/.png) in {}", .0.display())]
    NoReferenceImage(PathBuf),
    #[error(
        "image size mismatch: {} is {}x{}, expected {}x{}",
        path.display(), found.0, found.1, expected.0, expected.1
    )]
    DimensionMismatch {
        path: PathBuf,
        /// (width, height)
        expected: (u32, u32),
        /// (width, height)
        found: (u32, u32),
    },
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, TrunkmapError>;

impl TrunkmapError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
