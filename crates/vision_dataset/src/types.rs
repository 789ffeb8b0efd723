//! Core types and error definitions for vision_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no class directories found under {root}")]
    NoClasses { root: PathBuf },
    #[error("found no valid image file for class '{class}' under {root}")]
    EmptyClass { root: PathBuf, class: String },
    #[error("sample index {index} out of range for dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("sampler needs at least one replica")]
    NoReplicas,
    #[error("invalid rank {rank}, rank should be in the interval [0, {num_replicas})")]
    InvalidRank { rank: usize, num_replicas: usize },
    #[error("{0}")]
    Other(String),
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }
}

/// One decoded and transformed example.
#[derive(Debug, Clone)]
pub struct ImageSample {
    /// Image in CHW layout, already normalized.
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Class index into `ImageFolder::classes`.
    pub label: usize,
    pub path: PathBuf,
}
