//! Dataset and sampler construction for ImageNet-style folders.

use crate::error::TrainResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use vision_dataset::{DistributedSampler, ImageFolder, Interpolation, TransformPipeline};

/// Transform settings shared by the train and eval pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataArgs {
    pub interpolation: Interpolation,
    pub train_crop_size: u32,
    pub val_resize_size: u32,
    pub val_crop_size: u32,
    pub hflip_prob: f32,
    /// Seeds both the sampler shuffle and per-sample augmentation.
    pub seed: Option<u64>,
}

impl Default for DataArgs {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Bilinear,
            train_crop_size: 224,
            val_resize_size: 256,
            val_crop_size: 224,
            hflip_prob: 0.0,
            seed: None,
        }
    }
}

/// Build the train and test datasets and this rank's samplers over them.
///
/// Returns `(train_dataset, test_dataset, train_sampler, test_sampler)`.
pub fn load_data(
    train_dir: &Path,
    test_dir: &Path,
    args: &DataArgs,
    world_size: usize,
    rank: usize,
) -> TrainResult<(ImageFolder, ImageFolder, DistributedSampler, DistributedSampler)> {
    let train_pipeline =
        TransformPipeline::train(args.train_crop_size, args.interpolation, args.hflip_prob)
            .with_seed(args.seed);
    let test_pipeline =
        TransformPipeline::eval(args.val_resize_size, args.val_crop_size, args.interpolation);

    let train_dataset = ImageFolder::open(train_dir, train_pipeline)?;
    let test_dataset = ImageFolder::open(test_dir, test_pipeline)?;
    if train_dataset.classes() != test_dataset.classes() {
        tracing::warn!(
            train = train_dataset.classes().len(),
            test = test_dataset.classes().len(),
            "train and test folders list different classes; labels may not line up"
        );
    }

    let seed = args.seed.unwrap_or(0);
    let train_sampler =
        DistributedSampler::new(train_dataset.len(), world_size, rank)?.with_seed(seed);
    let test_sampler =
        DistributedSampler::new(test_dataset.len(), world_size, rank)?.with_seed(seed);

    if rank == 0 {
        tracing::info!(
            train = train_dataset.len(),
            test = test_dataset.len(),
            classes = train_dataset.classes().len(),
            shard = train_sampler.len(),
            "loaded datasets"
        );
        tracing::debug!(pipeline = %train_dataset.pipeline().describe(), "train transforms");
        tracing::debug!(pipeline = %test_dataset.pipeline().describe(), "test transforms");
    }

    Ok((train_dataset, test_dataset, train_sampler, test_sampler))
}
