//! Dynamic loss scaling for the mixed-precision training path.

use crate::error::{TrainError, TrainResult};
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

const DEFAULT_INIT_SCALE: f32 = 65536.0;
const DEFAULT_GROWTH_FACTOR: f32 = 2.0;
const DEFAULT_BACKOFF_FACTOR: f32 = 0.5;
const DEFAULT_GROWTH_INTERVAL: usize = 2000;

/// Per-step bookkeeping, cleared by [`GradScaler::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Ready,
    Unscaled { found_inf: bool },
    Stepped { found_inf: bool },
}

/// Gradient scaler for mixed-precision training.
///
/// The loss is multiplied by `scale` before the backward pass; gradients are divided by it
/// before the optimizer step. Steps whose gradients overflow are skipped and the scale backs
/// off; after `growth_interval` clean steps in a row it grows again.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
    enabled: bool,
    state: StepState,
    skipped_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            scale: DEFAULT_INIT_SCALE,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            growth_interval: DEFAULT_GROWTH_INTERVAL,
            growth_tracker: 0,
            enabled,
            state: StepState::Ready,
            skipped_steps: 0,
        }
    }

    pub fn with_init_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_growth_factor(mut self, factor: f32) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f32) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss scale; `1.0` when disabled.
    pub fn scale_value(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Optimizer steps skipped so far because of non-finite gradients.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide every parameter gradient by the scale in place and record whether any value is
    /// non-finite. Returns that flag.
    pub fn unscale<B, M>(&mut self, model: &M, grads: &mut GradientsParams) -> TrainResult<bool>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            return Ok(false);
        }
        match self.state {
            StepState::Ready => {}
            StepState::Unscaled { .. } => {
                return Err(TrainError::Scaler(
                    "unscale called twice since the last update".into(),
                ))
            }
            StepState::Stepped { .. } => {
                return Err(TrainError::Scaler(
                    "unscale called after step; call update first".into(),
                ))
            }
        }

        let mut visitor = Unscale::<B> {
            grads,
            inv_scale: 1.0 / self.scale,
            probe: None,
        };
        model.visit(&mut visitor);
        let found_inf = match visitor.probe {
            Some(probe) => !probe.into_scalar().elem::<f32>().is_finite(),
            None => false,
        };
        self.state = StepState::Unscaled { found_inf };
        Ok(found_inf)
    }

    /// Run `apply` (the optimizer step) unless the gradients overflowed, unscaling first when
    /// the caller has not. Returns the model unchanged on a skipped step.
    pub fn step<B, M, F>(
        &mut self,
        model: M,
        mut grads: GradientsParams,
        apply: F,
    ) -> TrainResult<M>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        F: FnOnce(M, GradientsParams) -> M,
    {
        if !self.enabled {
            return Ok(apply(model, grads));
        }
        let found_inf = match self.state {
            StepState::Ready => self.unscale::<B, M>(&model, &mut grads)?,
            StepState::Unscaled { found_inf } => found_inf,
            StepState::Stepped { .. } => {
                return Err(TrainError::Scaler(
                    "step called twice since the last update".into(),
                ))
            }
        };
        self.state = StepState::Stepped { found_inf };
        if found_inf {
            self.skipped_steps += 1;
            tracing::warn!(
                scale = self.scale,
                "non-finite gradients; skipping optimizer step"
            );
            Ok(model)
        } else {
            Ok(apply(model, grads))
        }
    }

    /// Adjust the scale from this step's overflow check and reset per-step state.
    pub fn update(&mut self) -> TrainResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let found_inf = match self.state {
            StepState::Ready => {
                return Err(TrainError::Scaler(
                    "no inf checks were recorded prior to update".into(),
                ))
            }
            StepState::Unscaled { found_inf } | StepState::Stepped { found_inf } => found_inf,
        };
        self.state = StepState::Ready;

        if found_inf {
            let previous = self.scale;
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!(from = previous, to = self.scale, "loss scale backoff");
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                let previous = self.scale;
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
                tracing::debug!(from = previous, to = self.scale, "loss scale growth");
            }
        }
        Ok(())
    }
}

struct Unscale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f32,
    // Sum of (g - g) over every gradient: zero when all finite, NaN otherwise.
    probe: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        let check = grad.clone().sub(grad.clone()).sum();
        self.probe = Some(match self.probe.take() {
            Some(acc) => acc.add(check),
            None => check,
        });
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::{Optimizer, SgdConfig};
    use burn_ndarray::NdArray;

    type B = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct Tiny<B: Backend> {
        fc: Linear<B>,
    }

    fn tiny_model() -> Tiny<B> {
        let device = Default::default();
        Tiny {
            fc: LinearConfig::new(2, 1).init(&device),
        }
    }

    fn grads_for(model: &Tiny<B>, scaler: &GradScaler, input: [f32; 2]) -> GradientsParams {
        let device = Default::default();
        let x = Tensor::<B, 2>::from_floats([input], &device);
        let loss = model.fc.forward(x).sum();
        GradientsParams::from_grads(scaler.scale(loss).backward(), model)
    }

    fn weight_grad(model: &Tiny<B>, grads: &GradientsParams) -> Vec<f32> {
        grads
            .get::<NdArray<f32>, 2>(model.fc.weight.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn unscale_recovers_true_gradients() {
        let model = tiny_model();
        let mut scaler = GradScaler::new(true).with_init_scale(1024.0);
        let mut grads = grads_for(&model, &scaler, [1.5, -2.0]);
        assert_eq!(weight_grad(&model, &grads), vec![1536.0, -2048.0]);
        let found_inf = scaler.unscale::<B, _>(&model, &mut grads).unwrap();
        assert!(!found_inf);
        assert_eq!(weight_grad(&model, &grads), vec![1.5, -2.0]);
    }

    #[test]
    fn double_unscale_is_an_error() {
        let model = tiny_model();
        let mut scaler = GradScaler::default();
        let mut grads = grads_for(&model, &scaler, [1.0, 1.0]);
        scaler.unscale::<B, _>(&model, &mut grads).unwrap();
        assert!(matches!(
            scaler.unscale::<B, _>(&model, &mut grads),
            Err(TrainError::Scaler(_))
        ));
    }

    #[test]
    fn update_without_step_is_an_error() {
        let mut scaler = GradScaler::default();
        assert!(scaler.update().is_err());
        assert!(GradScaler::new(false).update().is_ok());
    }

    #[test]
    fn overflow_skips_step_and_backs_off() {
        let model = tiny_model();
        let before = model.fc.weight.val().into_data().to_vec::<f32>().unwrap();
        let mut scaler = GradScaler::new(true).with_init_scale(f32::MAX);
        let grads = grads_for(&model, &scaler, [4.0, 4.0]);
        let mut optim = SgdConfig::new().init::<B, Tiny<B>>();
        let model = scaler
            .step::<B, _, _>(model, grads, |m, g| optim.step(0.1, m, g))
            .unwrap();
        scaler.update().unwrap();
        assert_eq!(model.fc.weight.val().into_data().to_vec::<f32>().unwrap(), before);
        assert_eq!(scaler.skipped_steps(), 1);
        assert_eq!(scaler.scale_value(), f32::MAX * 0.5);
    }

    #[test]
    fn scale_grows_after_interval_of_clean_steps() {
        let mut model = tiny_model();
        let mut scaler = GradScaler::new(true)
            .with_init_scale(8.0)
            .with_growth_interval(2);
        let mut optim = SgdConfig::new().init::<B, Tiny<B>>();
        for _ in 0..2 {
            let grads = grads_for(&model, &scaler, [0.5, 0.25]);
            model = scaler
                .step::<B, _, _>(model, grads, |m, g| optim.step(0.01, m, g))
                .unwrap();
            scaler.update().unwrap();
        }
        assert_eq!(scaler.scale_value(), 16.0);
        assert_eq!(scaler.skipped_steps(), 0);
    }

    #[test]
    fn disabled_scaler_is_pass_through() {
        let model = tiny_model();
        let scaler = GradScaler::new(false);
        assert_eq!(scaler.scale_value(), 1.0);
        let grads = grads_for(&model, &scaler, [3.0, 1.0]);
        assert_eq!(weight_grad(&model, &grads), vec![3.0, 1.0]);
    }
}
