//! ImageNet-style folder datasets and Burn batching for the training stack.
//!
//! This crate provides:
//! - `ImageFolder`: `<root>/<class>/<image>` discovery with sorted class indices
//! - `TransformPipeline`: random-resized-crop / resize / center-crop / normalize
//! - `DistributedSampler`: per-rank shards of a dataset, reshuffled every epoch
//! - `BatchLoader` / `BatchIter`: parallel decode into Burn tensors

pub mod batch;
pub mod folder;
pub mod sampler;
pub mod transform;
pub mod types;

pub use batch::{BatchIter, BatchLoader, ImageBatch};
pub use folder::{ImageFolder, IMAGE_EXTENSIONS};
pub use sampler::DistributedSampler;
pub use transform::{
    Interpolation, Transform, TransformPipeline, IMAGENET_MEAN, IMAGENET_STD,
};
pub use types::*;
