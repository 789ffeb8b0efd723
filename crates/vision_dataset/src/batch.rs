//! Batch iteration over a sampler shard, producing Burn tensors on a target device.

use crate::folder::ImageFolder;
use crate::sampler::DistributedSampler;
use crate::types::{DatasetError, DatasetResult, ImageSample};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A stacked batch: images `[batch, 3, height, width]` and class indices `[batch]`.
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Groups a dataset shard into fixed-size batches.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<ImageFolder>,
    batch_size: usize,
    drop_last: bool,
}

impl BatchLoader {
    pub fn new(dataset: Arc<ImageFolder>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            drop_last: false,
        }
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn dataset(&self) -> &Arc<ImageFolder> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one epoch over `sampler` yields.
    pub fn len(&self, sampler: &DistributedSampler) -> usize {
        if self.drop_last {
            sampler.len() / self.batch_size
        } else {
            sampler.len().div_ceil(self.batch_size)
        }
    }

    /// Start an epoch over the sampler's current shard.
    pub fn iter(&self, sampler: &DistributedSampler) -> BatchIter {
        BatchIter::new(
            Arc::clone(&self.dataset),
            sampler.indices(),
            self.batch_size,
            self.drop_last,
            sampler.epoch(),
        )
    }
}

pub struct BatchIter {
    dataset: Arc<ImageFolder>,
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    drop_last: bool,
    epoch: u64,
    processed_samples: usize,
    processed_batches: usize,
    started: Instant,
    total_load_time: Duration,
    images_buf: Vec<f32>,
    labels_buf: Vec<i64>,
}

impl BatchIter {
    pub fn new(
        dataset: Arc<ImageFolder>,
        indices: Vec<usize>,
        batch_size: usize,
        drop_last: bool,
        epoch: u64,
    ) -> Self {
        Self {
            dataset,
            indices,
            cursor: 0,
            batch_size: batch_size.max(1),
            drop_last,
            epoch,
            processed_samples: 0,
            processed_batches: 0,
            started: Instant::now(),
            total_load_time: Duration::ZERO,
            images_buf: Vec::new(),
            labels_buf: Vec::new(),
        }
    }

    pub fn processed_samples(&self) -> usize {
        self.processed_samples
    }

    pub fn processed_batches(&self) -> usize {
        self.processed_batches
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<ImageBatch<B>>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        if self.drop_last && end - self.cursor < self.batch_size {
            self.cursor = self.indices.len();
            return Ok(None);
        }
        let slice = &self.indices[self.cursor..end];
        self.cursor = end;

        let t_load = Instant::now();
        let dataset = &self.dataset;
        let epoch = self.epoch;
        let loaded: Vec<ImageSample> = slice
            .par_iter()
            .map(|&idx| dataset.get(idx, epoch))
            .collect::<DatasetResult<Vec<_>>>()?;
        let load_elapsed = t_load.elapsed();

        self.images_buf.clear();
        self.labels_buf.clear();
        let (width, height) = (loaded[0].width, loaded[0].height);
        let elems = loaded.len() * 3 * width as usize * height as usize;
        if self.images_buf.capacity() < elems {
            self.images_buf.reserve(elems - self.images_buf.capacity());
        }
        for sample in &loaded {
            if (sample.width, sample.height) != (width, height) {
                return Err(DatasetError::Other(format!(
                    "batch contains varying image sizes ({}x{} at {}, expected {}x{}); add a crop to the pipeline",
                    sample.width,
                    sample.height,
                    sample.path.display(),
                    width,
                    height
                )));
            }
            self.images_buf.extend_from_slice(&sample.image_chw);
            self.labels_buf.push(sample.label as i64);
        }

        let batch_len = loaded.len();
        let images = Tensor::<B, 1>::from_floats(self.images_buf.as_slice(), device).reshape([
            batch_len,
            3,
            height as usize,
            width as usize,
        ]);
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(self.labels_buf.clone(), [batch_len]),
            device,
        );

        self.processed_samples += batch_len;
        self.processed_batches += 1;
        self.total_load_time += load_elapsed;
        tracing::trace!(
            batch = self.processed_batches,
            samples = batch_len,
            load_ms = load_elapsed.as_secs_f64() * 1000.0,
            avg_load_ms = self.total_load_time.as_secs_f64() * 1000.0 / self.processed_batches as f64,
            elapsed_s = self.started.elapsed().as_secs_f32(),
            "decoded batch"
        );

        Ok(Some(ImageBatch { images, targets }))
    }
}
