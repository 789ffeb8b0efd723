//! One-epoch training and evaluation passes over a rank's data shard.

use crate::distributed::{Collective, DistributedOptimizer};
use crate::error::TrainResult;
use crate::metrics::{targets_to_usize, tensor_to_f32, topk_correct};
use crate::scaler::GradScaler;
use crate::tracker::{Metrics, RunTracker};
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use models::ImageClassifier;
use std::sync::Arc;
use std::time::Instant;
use vision_dataset::{BatchLoader, DistributedSampler, ImageFolder};

/// A rank's sampler together with the loader that batches it.
#[derive(Debug, Clone)]
pub struct DataShard {
    pub sampler: DistributedSampler,
    pub loader: BatchLoader,
}

impl DataShard {
    pub fn new(dataset: Arc<ImageFolder>, sampler: DistributedSampler, batch_size: usize) -> Self {
        Self {
            sampler,
            loader: BatchLoader::new(dataset, batch_size),
        }
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.loader.len(&self.sampler)
    }

    /// Samples in this rank's partition.
    pub fn num_samples(&self) -> usize {
        self.sampler.len()
    }
}

/// Settings shared by the passes of one epoch. `D` is the backend device type; an autodiff
/// backend and its inner backend share it, so one context serves training and evaluation.
#[derive(Debug, Clone)]
pub struct EpochContext<D> {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Print a progress line every `log_interval` batches.
    pub log_interval: usize,
    pub lr: f64,
    pub device: D,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
    pub samples: usize,
}

struct StepReport {
    batch_idx: usize,
    num_batches: usize,
    batch_len: usize,
    loss: f32,
    step_secs: f64,
    loss_scale: Option<f32>,
}

fn report_train_step<D>(
    ctx: &EpochContext<D>,
    shard_len: usize,
    step: &StepReport,
    tracker: Option<&mut (dyn RunTracker + '_)>,
) {
    if let Some(tracker) = tracker {
        let global_step = (ctx.epoch.saturating_sub(1) * step.num_batches + step.batch_idx) as u64;
        let mut metrics = Metrics::new();
        metrics.insert("train/loss".into(), step.loss as f64);
        metrics.insert("train/epoch".into(), ctx.epoch as f64);
        metrics.insert("train/step".into(), global_step as f64);
        metrics.insert(
            "train/samples_seen".into(),
            (global_step * step.batch_len as u64) as f64,
        );
        metrics.insert(
            "perf/rank_samples_per_second".into(),
            step.batch_len as f64 / step.step_secs.max(f64::EPSILON),
        );
        if let Err(err) = tracker.log(&metrics, Some(global_step)) {
            tracing::warn!("tracker rejected train metrics: {err}");
        }
    }

    if step.batch_idx % ctx.log_interval.max(1) == 0 {
        let processed = step.batch_idx * step.batch_len;
        let pct = 100.0 * step.batch_idx as f64 / step.num_batches.max(1) as f64;
        match step.loss_scale {
            Some(scale) => tracing::info!(
                "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}\tLoss Scale: {:?}",
                ctx.epoch,
                processed,
                shard_len,
                pct,
                step.loss,
                scale
            ),
            None => tracing::info!(
                "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                ctx.epoch,
                processed,
                shard_len,
                pct,
                step.loss
            ),
        }
    }
}

/// Full-precision epoch: forward, loss, backward, then a distributed optimizer step that
/// averages gradients across ranks before applying them.
pub fn train_epoch<B, M, O, C>(
    mut model: M,
    criterion: &CrossEntropyLoss<B>,
    shard: &mut DataShard,
    optimizer: &mut DistributedOptimizer<O, C>,
    ctx: &EpochContext<B::Device>,
    mut tracker: Option<&mut dyn RunTracker>,
) -> TrainResult<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    O: Optimizer<M, B>,
    C: Collective,
{
    shard.sampler.set_epoch(ctx.epoch as u64);
    let num_batches = shard.num_batches();
    let shard_len = shard.num_samples();
    let mut iter = shard.loader.iter(&shard.sampler);

    let mut batch_idx = 0usize;
    while let Some(batch) = iter.next_batch::<B>(&ctx.device)? {
        let step_start = Instant::now();
        let batch_len = batch.len();

        let output = model.forward(batch.images);
        let loss = criterion.forward(output, batch.targets);
        let loss_value = loss.clone().into_scalar().elem::<f32>();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(ctx.lr, model, grads)?;

        let step = StepReport {
            batch_idx,
            num_batches,
            batch_len,
            loss: loss_value,
            step_secs: step_start.elapsed().as_secs_f64(),
            loss_scale: None,
        };
        report_train_step(ctx, shard_len, &step, tracker.as_deref_mut());
        batch_idx += 1;
    }
    Ok(model)
}

/// Mixed-precision epoch: the loss is scaled before backward, gradients are synchronized
/// across ranks, unscaled, and the optimizer step is skipped when any of them overflowed.
#[allow(clippy::too_many_arguments)]
pub fn train_mixed_precision<B, M, O, C>(
    mut model: M,
    criterion: &CrossEntropyLoss<B>,
    shard: &mut DataShard,
    optimizer: &mut DistributedOptimizer<O, C>,
    scaler: &mut GradScaler,
    ctx: &EpochContext<B::Device>,
    mut tracker: Option<&mut dyn RunTracker>,
) -> TrainResult<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    O: Optimizer<M, B>,
    C: Collective,
{
    shard.sampler.set_epoch(ctx.epoch as u64);
    let num_batches = shard.num_batches();
    let shard_len = shard.num_samples();
    let mut iter = shard.loader.iter(&shard.sampler);

    let mut batch_idx = 0usize;
    while let Some(batch) = iter.next_batch::<B>(&ctx.device)? {
        let step_start = Instant::now();
        let batch_len = batch.len();

        let output = model.forward(batch.images);
        let loss = criterion.forward(output, batch.targets);
        let loss_value = loss.clone().into_scalar().elem::<f32>();
        let mut grads = GradientsParams::from_grads(scaler.scale(loss).backward(), &model);

        optimizer.synchronize::<B, M>(&model, &mut grads)?;
        scaler.unscale::<B, M>(&model, &mut grads)?;
        model = scaler.step::<B, M, _>(model, grads, |model, grads| {
            optimizer.step_synchronized::<B, M>(ctx.lr, model, grads)
        })?;
        scaler.update()?;

        let step = StepReport {
            batch_idx,
            num_batches,
            batch_len,
            loss: loss_value,
            step_secs: step_start.elapsed().as_secs_f64(),
            loss_scale: Some(scaler.scale_value()),
        };
        report_train_step(ctx, shard_len, &step, tracker.as_deref_mut());
        batch_idx += 1;
    }
    Ok(model)
}

/// Gradient-free pass over the test shard.
///
/// Loss and top-1/top-5 hits are summed per sample and divided by the shard size, so the
/// loss is a per-sample mean and the accuracies are percentages.
pub fn evaluate<B, M>(
    model: &M,
    criterion: &CrossEntropyLoss<B>,
    shard: &DataShard,
    ctx: &EpochContext<B::Device>,
    tracker: Option<&mut dyn RunTracker>,
) -> TrainResult<EvalSummary>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    let mut iter = shard.loader.iter(&shard.sampler);
    let mut loss_sum = 0.0f64;
    let mut correct = [0usize; 2];

    while let Some(batch) = iter.next_batch::<B>(&ctx.device)? {
        let batch_len = batch.len();
        let output = model.forward(batch.images);
        let loss = criterion.forward(output.clone(), batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>() * batch_len as f64;

        let num_classes = output.dims()[1];
        let scores = tensor_to_f32(output)?;
        let targets = targets_to_usize(batch.targets)?;
        let hits = topk_correct(&scores, num_classes, &targets, &[1, 5])?;
        correct[0] += hits[0];
        correct[1] += hits[1];
    }

    let n = shard.num_samples().max(1) as f64;
    let summary = EvalSummary {
        loss: loss_sum / n,
        acc1: 100.0 * correct[0] as f64 / n,
        acc5: 100.0 * correct[1] as f64 / n,
        samples: iter.processed_samples(),
    };

    if let Some(tracker) = tracker {
        let mut metrics = Metrics::new();
        metrics.insert("test/loss".into(), summary.loss);
        metrics.insert("test/epoch".into(), ctx.epoch as f64);
        metrics.insert("test/acc1".into(), summary.acc1);
        metrics.insert("test/acc5".into(), summary.acc5);
        if let Err(err) = tracker.log(&metrics, None) {
            tracing::warn!("tracker rejected test metrics: {err}");
        }
    }

    tracing::info!(
        "Test Epoch: {}\tloss={:.4}\tAcc@1={:.3}\tAcc@5={:.3}",
        ctx.epoch,
        summary.loss,
        summary.acc1,
        summary.acc5
    );
    Ok(summary)
}
