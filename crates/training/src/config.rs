//! Command-line and TOML configuration for the `train` and `eval` binaries.

use crate::data::DataArgs;
use anyhow::{bail, Context};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use models::ResNetDepth;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use vision_dataset::Interpolation;

/// Environment variable naming a TOML config file when `--config` is absent.
pub const CONFIG_ENV: &str = "RESNET_TRAIN_CONFIG";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[value(name = "resnet18")]
    Resnet18,
    #[value(name = "resnet34")]
    Resnet34,
    #[value(name = "resnet50")]
    Resnet50,
    #[value(name = "resnet101")]
    Resnet101,
    #[value(name = "resnet152")]
    Resnet152,
}

impl Arch {
    pub fn depth(self) -> ResNetDepth {
        match self {
            Arch::Resnet18 => ResNetDepth::R18,
            Arch::Resnet34 => ResNetDepth::R34,
            Arch::Resnet50 => ResNetDepth::R50,
            Arch::Resnet101 => ResNetDepth::R101,
            Arch::Resnet152 => ResNetDepth::R152,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug, Clone, Serialize)]
#[command(
    name = "train",
    about = "Train a ResNet classifier on ImageNet-style folders with data-parallel workers"
)]
pub struct TrainArgs {
    /// Training images, one sub-directory per class.
    #[arg(long)]
    pub train_dir: Option<PathBuf>,
    /// Validation images, same layout as --train-dir.
    #[arg(long)]
    pub test_dir: Option<PathBuf>,
    /// Network architecture.
    #[arg(long, value_enum, default_value_t = Arch::Resnet50)]
    pub arch: Arch,
    /// Output classes (defaults to the number of class folders).
    #[arg(long)]
    pub num_classes: Option<usize>,
    #[arg(long, default_value_t = 90)]
    pub epochs: usize,
    /// Per-worker training batch size.
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 64)]
    pub test_batch_size: usize,
    #[arg(long, default_value_t = 0.1)]
    pub lr: f64,
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f32,
    #[arg(long, default_value_t = 0.0)]
    pub label_smoothing: f32,
    /// Seed for shuffling and augmentation.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Batches between console progress lines.
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,
    /// Train with dynamic loss scaling.
    #[arg(long, default_value_t = false)]
    pub fp16: bool,
    /// Number of data-parallel workers.
    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    pub world_size: usize,
    /// Rank assigned by an external launcher; only valid with a world size of 1.
    #[arg(long, env = "RANK")]
    pub rank: Option<usize>,
    #[arg(long, default_value = "bilinear")]
    pub interpolation: Interpolation,
    #[arg(long, default_value_t = 224)]
    pub train_crop_size: u32,
    #[arg(long, default_value_t = 256)]
    pub val_resize_size: u32,
    #[arg(long, default_value_t = 224)]
    pub val_crop_size: u32,
    /// Horizontal flip probability for training images; 0 keeps the plain crop recipe.
    #[arg(long, default_value_t = 0.0)]
    pub hflip_prob: f32,
    /// Directory for per-epoch checkpoints.
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,
    /// Checkpoint to load weights from before training.
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Append run metrics to this JSONL file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Dashboard endpoint receiving run metrics.
    #[arg(long, env = "TRACKER_URL")]
    pub tracker_url: Option<String>,
    #[arg(long, default_value = "resnet")]
    pub project: String,
    #[arg(long)]
    pub run_name: Option<String>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// TOML file supplying defaults for any flag not given on the command line.
    #[arg(long, env = CONFIG_ENV)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

/// Optional overrides read from `--config`. Keys match the long flag names with underscores.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TrainConfigFile {
    train_dir: Option<PathBuf>,
    test_dir: Option<PathBuf>,
    arch: Option<Arch>,
    num_classes: Option<usize>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    test_batch_size: Option<usize>,
    lr: Option<f64>,
    momentum: Option<f64>,
    weight_decay: Option<f32>,
    label_smoothing: Option<f32>,
    seed: Option<u64>,
    log_interval: Option<usize>,
    fp16: Option<bool>,
    world_size: Option<usize>,
    interpolation: Option<Interpolation>,
    train_crop_size: Option<u32>,
    val_resize_size: Option<u32>,
    val_crop_size: Option<u32>,
    hflip_prob: Option<f32>,
    checkpoint_dir: Option<PathBuf>,
    resume: Option<PathBuf>,
    metrics_out: Option<PathBuf>,
    tracker_url: Option<String>,
    project: Option<String>,
    run_name: Option<String>,
    backend: Option<BackendKind>,
}

impl TrainConfigFile {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn set_by_user(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

// File values fill in whatever the user did not pass explicitly.
macro_rules! merge_file_values {
    ($args:ident, $file:ident, $matches:ident; values: [$($v:ident),* $(,)?]; options: [$($o:ident),* $(,)?]) => {
        $(
            if let Some(value) = $file.$v {
                if !set_by_user($matches, stringify!($v)) {
                    $args.$v = value;
                }
            }
        )*
        $(
            if let Some(value) = $file.$o {
                if !set_by_user($matches, stringify!($o)) {
                    $args.$o = Some(value);
                }
            }
        )*
    };
}

impl TrainArgs {
    /// Parse the process arguments, exiting on `--help` or usage errors, then apply the
    /// config file and validate.
    pub fn load() -> anyhow::Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches)
    }

    /// Like [`TrainArgs::load`] over an explicit argument list, returning usage errors.
    pub fn load_from<I, T>(argv: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(argv)?;
        Self::from_matches(&matches)
    }

    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let mut args = Self::from_arg_matches(matches)?;
        if let Some(path) = args.config.clone() {
            let file = TrainConfigFile::from_path(&path)?;
            args.merge_file(file, matches);
        }
        args.validate()?;
        Ok(args)
    }

    pub fn merge_file(&mut self, file: TrainConfigFile, matches: &ArgMatches) {
        let args = self;
        merge_file_values!(args, file, matches;
            values: [
                arch, epochs, batch_size, test_batch_size, lr, momentum, weight_decay,
                label_smoothing, log_interval, fp16, world_size, interpolation,
                train_crop_size, val_resize_size, val_crop_size, hflip_prob, checkpoint_dir,
                project, backend,
            ];
            options: [
                train_dir, test_dir, num_classes, seed, resume, metrics_out, tracker_url,
                run_name,
            ]
        );
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.train_dir.is_none() || self.test_dir.is_none() {
            bail!("both --train-dir and --test-dir are required (flag or config file)");
        }
        if self.log_interval == 0 {
            bail!("--log-interval must be at least 1");
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            bail!("batch sizes must be at least 1");
        }
        if self.epochs == 0 {
            bail!("--epochs must be at least 1");
        }
        if self.world_size == 0 {
            bail!("--world-size must be at least 1");
        }
        if let Some(rank) = self.rank {
            if rank >= self.world_size {
                bail!(
                    "rank {rank} is outside a world of {} workers",
                    self.world_size
                );
            }
        }
        if !(0.0..=1.0).contains(&self.hflip_prob) {
            bail!("--hflip-prob must be within [0, 1]");
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            bail!("--label-smoothing must be within [0, 1)");
        }
        if self.num_classes == Some(0) {
            bail!("--num-classes must be at least 1");
        }
        Ok(())
    }

    pub fn data_args(&self) -> DataArgs {
        DataArgs {
            interpolation: self.interpolation,
            train_crop_size: self.train_crop_size,
            val_resize_size: self.val_resize_size,
            val_crop_size: self.val_crop_size,
            hflip_prob: self.hflip_prob,
            seed: self.seed,
        }
    }

    pub fn run_name(&self) -> String {
        self.run_name.clone().unwrap_or_else(|| {
            format!(
                "{}-bs{}x{}{}",
                self.arch.to_possible_value().map_or("resnet".into(), |v| v.get_name().to_string()),
                self.batch_size,
                self.world_size,
                if self.fp16 { "-fp16" } else { "" }
            )
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "eval",
    about = "Evaluate a ResNet checkpoint on an ImageNet-style folder (loss, Acc@1, Acc@5)"
)]
pub struct EvalArgs {
    /// Images to evaluate, one sub-directory per class.
    #[arg(long)]
    pub data_dir: PathBuf,
    /// Checkpoint path to load.
    #[arg(long)]
    pub checkpoint: PathBuf,
    #[arg(long, value_enum, default_value_t = Arch::Resnet50)]
    pub arch: Arch,
    /// Output classes (defaults to the number of class folders).
    #[arg(long)]
    pub num_classes: Option<usize>,
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    #[arg(long, default_value = "bilinear")]
    pub interpolation: Interpolation,
    #[arg(long, default_value_t = 256)]
    pub val_resize_size: u32,
    #[arg(long, default_value_t = 224)]
    pub val_crop_size: u32,
    #[arg(long, default_value_t = 0.0)]
    pub label_smoothing: f32,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Append the summary to this JSONL file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}
