use std::path::PathBuf;
use thiserror::Error;
use vision_dataset::DatasetError;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
    #[error("invalid accuracy input: {0}")]
    Accuracy(String),
    #[error("collective operation failed: {0}")]
    Collective(String),
    #[error("loss scaler misuse: {0}")]
    Scaler(String),
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint error at {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
}

impl TrainError {
    pub(crate) fn tensor_data(err: impl std::fmt::Debug) -> Self {
        TrainError::TensorData(format!("{err:?}"))
    }
}
