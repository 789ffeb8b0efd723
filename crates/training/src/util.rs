use crate::config::BackendKind;
use crate::error::{TrainError, TrainResult};
use burn::backend::Autodiff;
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use models::{ResNet, ResNetConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = Autodiff<TrainBackend>;

pub type TrainDevice = <TrainBackend as Backend>::Device;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Device for a worker. Multi-worker WGPU runs place each rank on its own adapter.
#[cfg(feature = "backend-wgpu")]
pub fn worker_device(rank: usize, world_size: usize) -> TrainDevice {
    if world_size > 1 {
        burn_wgpu::WgpuDevice::DiscreteGpu(rank)
    } else {
        TrainDevice::default()
    }
}

#[cfg(not(feature = "backend-wgpu"))]
pub fn worker_device(_rank: usize, _world_size: usize) -> TrainDevice {
    TrainDevice::default()
}

pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("resnet_epoch_{epoch}.bin"))
}

/// Epoch number encoded in a `resnet_epoch_<n>.bin` file name.
pub fn checkpoint_epoch(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("resnet_epoch_")?
        .parse()
        .ok()
}

pub fn save_checkpoint<B: Backend>(model: &ResNet<B>, path: &Path) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| TrainError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            msg: format!("failed to save: {e}"),
        })
}

pub fn load_checkpoint<B: Backend>(
    config: &ResNetConfig,
    path: &Path,
    device: &B::Device,
) -> TrainResult<ResNet<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    config
        .init::<B>(device)
        .load_file(path, &recorder, device)
        .map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            msg: format!("failed to load: {e}"),
        })
}
