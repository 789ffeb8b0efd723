//! Entry points behind the `train` and `eval` binaries.

use crate::config::{EvalArgs, TrainArgs};
use crate::data::load_data;
use crate::distributed::{broadcast_parameters, Collective, DistributedOptimizer, ThreadGroup};
use crate::epoch::{evaluate, train_epoch, train_mixed_precision, DataShard, EpochContext};
use crate::scaler::GradScaler;
use crate::tracker::{HttpTracker, JsonlTracker, RunTracker, TrackerSet};
use crate::util::{
    checkpoint_epoch, checkpoint_path, load_checkpoint, save_checkpoint, validate_backend_choice,
    worker_device, ADBackend, TrainBackend,
};
use anyhow::{anyhow, bail, Context};
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::SgdConfig;
use models::{ResNet, ResNetConfig};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use vision_dataset::{DistributedSampler, ImageFolder, TransformPipeline};

/// Aborts the worker group unless disarmed, so a failing or panicking rank releases its peers.
struct AbortOnDrop<'a> {
    collective: &'a ThreadGroup,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.collective.abort();
        }
    }
}

/// Train for `args.epochs` epochs with `args.world_size` data-parallel workers hosted as
/// threads of this process.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    args.validate()?;
    validate_backend_choice(args.backend)?;
    if let Some(rank) = args.rank {
        if args.world_size > 1 {
            bail!(
                "launched as rank {rank} of {}; this binary hosts every rank itself, start one process without RANK",
                args.world_size
            );
        }
    }

    fs::create_dir_all(&args.checkpoint_dir).with_context(|| {
        format!(
            "failed to create checkpoint dir {}",
            args.checkpoint_dir.display()
        )
    })?;
    let config_path = args.checkpoint_dir.join("train_config.json");
    fs::write(&config_path, serde_json::to_vec_pretty(&args)?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    tracing::info!(
        arch = ?args.arch,
        world_size = args.world_size,
        fp16 = args.fp16,
        epochs = args.epochs,
        "starting training"
    );

    let group = ThreadGroup::new_group(args.world_size);
    let results: Vec<anyhow::Result<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                let args = &args;
                s.spawn(move || {
                    let span = tracing::info_span!("worker", rank = member.rank());
                    let _enter = span.enter();
                    let mut guard = AbortOnDrop {
                        collective: &member,
                        armed: true,
                    };
                    let result = train_worker(args, member.clone());
                    if let Err(err) = &result {
                        tracing::error!("worker failed: {err:#}");
                    } else {
                        guard.armed = false;
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("training worker panicked")))
            })
            .collect()
    });

    // Report the root cause; peers of a failed rank only see the aborted group.
    let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        tracing::info!(dir = %args.checkpoint_dir.display(), "training finished");
        return Ok(());
    }
    let root = errors
        .iter()
        .position(|e| !format!("{e:#}").contains("worker group aborted"))
        .unwrap_or(0);
    Err(errors.swap_remove(root))
}

fn build_tracker(args: &TrainArgs) -> anyhow::Result<Option<TrackerSet>> {
    let mut set = TrackerSet::new();
    if let Some(path) = &args.metrics_out {
        set.push(Box::new(JsonlTracker::create(path)?));
    }
    if let Some(url) = &args.tracker_url {
        set.push(Box::new(HttpTracker::new(
            url.clone(),
            args.project.clone(),
            args.run_name(),
        )?));
    }
    Ok((!set.is_empty()).then_some(set))
}

fn train_worker(args: &TrainArgs, collective: ThreadGroup) -> anyhow::Result<()> {
    let rank = collective.rank();
    let world_size = collective.world_size();
    let device = worker_device(rank, world_size);

    let train_dir = args.train_dir.as_deref().context("--train-dir is required")?;
    let test_dir = args.test_dir.as_deref().context("--test-dir is required")?;
    let (train_dataset, test_dataset, train_sampler, test_sampler) =
        load_data(train_dir, test_dir, &args.data_args(), world_size, rank)?;
    let num_classes = args
        .num_classes
        .unwrap_or_else(|| train_dataset.classes().len());
    let mut train_shard = DataShard::new(Arc::new(train_dataset), train_sampler, args.batch_size);
    let test_shard = DataShard::new(Arc::new(test_dataset), test_sampler, args.test_batch_size);

    let model_config = ResNetConfig::new(args.arch.depth(), num_classes);
    let mut model: ResNet<ADBackend> = match &args.resume {
        Some(path) => {
            tracing::info!(path = %path.display(), "resuming from checkpoint");
            load_checkpoint::<ADBackend>(&model_config, path, &device)?
        }
        None => model_config.init::<ADBackend>(&device),
    };
    model = broadcast_parameters(&collective, model, 0)?;

    let momentum = (args.momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(args.momentum)
            .with_dampening(0.0)
    });
    let weight_decay = (args.weight_decay > 0.0).then(|| WeightDecayConfig::new(args.weight_decay));
    let sgd = SgdConfig::new()
        .with_momentum(momentum)
        .with_weight_decay(weight_decay)
        .init::<ADBackend, ResNet<ADBackend>>();
    let mut optimizer = DistributedOptimizer::new(sgd, collective);

    let smoothing = (args.label_smoothing > 0.0).then_some(args.label_smoothing);
    let criterion = CrossEntropyLossConfig::new()
        .with_smoothing(smoothing)
        .init::<ADBackend>(&device);
    let eval_criterion = CrossEntropyLossConfig::new()
        .with_smoothing(smoothing)
        .init::<TrainBackend>(&device);

    let mut scaler = args.fp16.then(GradScaler::default);
    let mut tracker = if rank == 0 { build_tracker(args)? } else { None };

    for epoch in 1..=args.epochs {
        let ctx = EpochContext {
            epoch,
            log_interval: args.log_interval,
            lr: args.lr,
            device: device.clone(),
        };
        let started = Instant::now();
        model = match scaler.as_mut() {
            Some(scaler) => train_mixed_precision(
                model,
                &criterion,
                &mut train_shard,
                &mut optimizer,
                scaler,
                &ctx,
                tracker.as_mut().map(|t| t as &mut dyn RunTracker),
            )?,
            None => train_epoch(
                model,
                &criterion,
                &mut train_shard,
                &mut optimizer,
                &ctx,
                tracker.as_mut().map(|t| t as &mut dyn RunTracker),
            )?,
        };
        let train_secs = started.elapsed().as_secs_f64();

        let summary = evaluate(
            &model.valid(),
            &eval_criterion,
            &test_shard,
            &ctx,
            tracker.as_mut().map(|t| t as &mut dyn RunTracker),
        )?;

        if rank == 0 {
            let path = checkpoint_path(&args.checkpoint_dir, epoch);
            save_checkpoint(&model, &path)?;
            tracing::info!(
                epoch,
                train_secs,
                acc1 = summary.acc1,
                path = %path.display(),
                "saved checkpoint"
            );
        }
    }

    if let Some(tracker) = tracker.as_mut() {
        tracker.finish()?;
    }
    Ok(())
}

/// Load a checkpoint and report loss, Acc@1 and Acc@5 over a folder.
pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    let device = worker_device(0, 1);

    let pipeline =
        TransformPipeline::eval(args.val_resize_size, args.val_crop_size, args.interpolation);
    let dataset = ImageFolder::open(&args.data_dir, pipeline)?;
    let num_classes = args.num_classes.unwrap_or_else(|| dataset.classes().len());
    let sampler = DistributedSampler::new(dataset.len(), 1, 0)?.with_shuffle(false);
    let shard = DataShard::new(Arc::new(dataset), sampler, args.batch_size);

    let model_config = ResNetConfig::new(args.arch.depth(), num_classes);
    let model = load_checkpoint::<TrainBackend>(&model_config, &args.checkpoint, &device)?;
    let smoothing = (args.label_smoothing > 0.0).then_some(args.label_smoothing);
    let criterion = CrossEntropyLossConfig::new()
        .with_smoothing(smoothing)
        .init::<TrainBackend>(&device);

    let ctx = EpochContext {
        epoch: checkpoint_epoch(&args.checkpoint).unwrap_or(0),
        log_interval: 1,
        lr: 0.0,
        device,
    };
    let mut tracker = match &args.metrics_out {
        Some(path) => Some(JsonlTracker::create(path)?),
        None => None,
    };
    let summary = evaluate(
        &model,
        &criterion,
        &shard,
        &ctx,
        tracker.as_mut().map(|t| t as &mut dyn RunTracker),
    )?;
    if let Some(tracker) = tracker.as_mut() {
        tracker.finish()?;
    }
    tracing::info!(
        samples = summary.samples,
        loss = summary.loss,
        acc1 = summary.acc1,
        acc5 = summary.acc5,
        "evaluation complete"
    );
    Ok(())
}
