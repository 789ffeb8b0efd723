#![recursion_limit = "256"]

pub mod config;
pub mod data;
pub mod distributed;
pub mod epoch;
pub mod error;
pub mod metrics;
pub mod run;
pub mod scaler;
pub mod tracker;
pub mod util;

pub use config::{Arch, BackendKind, EvalArgs, TrainArgs};
pub use data::{load_data, DataArgs};
pub use distributed::{
    all_reduce_gradients, broadcast_parameters, Collective, DistributedOptimizer, SingleProcess,
    ThreadGroup,
};
pub use epoch::{evaluate, train_epoch, train_mixed_precision, DataShard, EpochContext, EvalSummary};
pub use error::{TrainError, TrainResult};
pub use metrics::{accuracy, accuracy_soft, topk_correct};
pub use models::{ImageClassifier, ResNet, ResNetConfig, ResNetDepth};
pub use run::{run_eval, run_train};
pub use scaler::GradScaler;
pub use tracker::{read_metrics, HttpTracker, JsonlTracker, MetricRecord, Metrics, RunTracker, TrackerSet};
pub use util::{ADBackend, TrainBackend};
