//! Gradient synchronization across data-parallel workers.
//!
//! Workers exchange flattened gradient buffers through a [`Collective`]. [`ThreadGroup`]
//! hosts every rank inside one process, one thread per rank.

use crate::error::{TrainError, TrainResult};
use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A group of workers that can exchange `f32` buffers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Replace `buf` with the element-wise mean of every rank's `buf`. All ranks must call
    /// this with buffers of the same length.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> TrainResult<()>;

    /// Replace `buf` on every rank with the contents of `root`'s `buf`.
    fn broadcast(&self, buf: &mut [f32], root: usize) -> TrainResult<()>;

    /// Wake any rank blocked in a collective call with an error. Called when a worker fails
    /// so its peers do not wait forever.
    fn abort(&self) {}
}

/// World of one; every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _buf: &mut [f32]) -> TrainResult<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f32], root: usize) -> TrainResult<()> {
        if root != 0 {
            return Err(TrainError::Collective(format!(
                "broadcast root {root} outside a world of 1"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    parts: Vec<Vec<f32>>,
    result: Vec<f32>,
    aborted: bool,
}

#[derive(Debug)]
struct Rendezvous {
    world_size: usize,
    round: Mutex<Round>,
    cvar: Condvar,
}

fn poisoned<T>(_: T) -> TrainError {
    TrainError::Collective("rendezvous lock poisoned".into())
}

impl Rendezvous {
    fn lock(&self) -> TrainResult<MutexGuard<'_, Round>> {
        self.round.lock().map_err(poisoned)
    }
}

/// One rank of an in-process worker group. Create the whole group with
/// [`ThreadGroup::new_group`] and move one member into each worker thread.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadGroup {
    pub fn new_group(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Rendezvous {
            world_size,
            round: Mutex::new(Round {
                parts: vec![Vec::new(); world_size],
                ..Round::default()
            }),
            cvar: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Deposit `buf`, wait for every rank, and copy back what the last arrival computed from
    /// all contributions (indexed by rank) with `combine`.
    fn exchange<F>(&self, buf: &mut [f32], combine: F) -> TrainResult<()>
    where
        F: FnOnce(&[Vec<f32>]) -> Result<Vec<f32>, String>,
    {
        let world = self.shared.world_size;
        let mut round = self.shared.lock()?;
        if round.aborted {
            return Err(TrainError::Collective("worker group aborted".into()));
        }
        round.parts[self.rank].clear();
        round.parts[self.rank].extend_from_slice(buf);
        round.arrived += 1;

        if round.arrived == world {
            let combined = combine(&round.parts).and_then(|out| {
                if out.len() == buf.len() {
                    Ok(out)
                } else {
                    Err(format!(
                        "rank {} holds {} values, result has {}",
                        self.rank,
                        buf.len(),
                        out.len()
                    ))
                }
            });
            match combined {
                Ok(out) => {
                    round.result = out;
                    round.arrived = 0;
                    round.generation = round.generation.wrapping_add(1);
                    buf.copy_from_slice(&round.result);
                    self.shared.cvar.notify_all();
                    return Ok(());
                }
                Err(msg) => {
                    round.aborted = true;
                    self.shared.cvar.notify_all();
                    return Err(TrainError::Collective(msg));
                }
            }
        }

        let generation = round.generation;
        while round.generation == generation && !round.aborted {
            round = self.shared.cvar.wait(round).map_err(poisoned)?;
        }
        if round.generation == generation {
            return Err(TrainError::Collective("worker group aborted".into()));
        }
        // A new round cannot complete before this rank joins it, so `result` is still ours.
        if round.result.len() != buf.len() {
            return Err(TrainError::Collective(format!(
                "rank {} holds {} values, result has {}",
                self.rank,
                buf.len(),
                round.result.len()
            )));
        }
        buf.copy_from_slice(&round.result);
        Ok(())
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> TrainResult<()> {
        if self.shared.world_size == 1 {
            return Ok(());
        }
        self.exchange(buf, |parts| {
            let len = parts[0].len();
            if let Some(bad) = parts.iter().position(|p| p.len() != len) {
                return Err(format!(
                    "rank {bad} contributed {} values, rank 0 contributed {len}",
                    parts[bad].len()
                ));
            }
            let inv = 1.0 / parts.len() as f32;
            let mut sum = parts[0].clone();
            for part in &parts[1..] {
                for (acc, v) in sum.iter_mut().zip(part) {
                    *acc += *v;
                }
            }
            Ok(sum.into_iter().map(|v| v * inv).collect())
        })
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> TrainResult<()> {
        if root >= self.shared.world_size {
            return Err(TrainError::Collective(format!(
                "broadcast root {root} outside a world of {}",
                self.shared.world_size
            )));
        }
        if self.shared.world_size == 1 {
            return Ok(());
        }
        self.exchange(buf, |parts| Ok(parts[root].clone()))
    }

    fn abort(&self) {
        if let Ok(mut round) = self.shared.round.lock() {
            round.aborted = true;
        }
        self.shared.cvar.notify_all();
    }
}

struct GradSlot {
    id: ParamId,
    shape: Vec<usize>,
    offset: usize,
    len: usize,
}

struct Flatten<'a> {
    grads: &'a GradientsParams,
    slots: Vec<GradSlot>,
    values: Vec<f32>,
    error: Option<TrainError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Flatten<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) else {
            return;
        };
        let shape = grad.dims().to_vec();
        match grad.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => {
                self.slots.push(GradSlot {
                    id,
                    shape,
                    offset: self.values.len(),
                    len: values.len(),
                });
                self.values.extend(values);
            }
            Err(err) => self.error = Some(TrainError::tensor_data(err)),
        }
    }
}

struct Scatter<'a> {
    grads: &'a mut GradientsParams,
    slots: std::slice::Iter<'a, GradSlot>,
    values: &'a [f32],
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Scatter<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(old) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        // Flatten visited the same parameters in the same order.
        let Some(slot) = self.slots.next().filter(|slot| slot.id == id) else {
            self.grads.register::<B::InnerBackend, D>(id, old);
            return;
        };
        let data = TensorData::new(
            self.values[slot.offset..slot.offset + slot.len].to_vec(),
            slot.shape.clone(),
        );
        let device = old.device();
        self.grads
            .register::<B::InnerBackend, D>(id, Tensor::from_data(data, &device));
    }
}

/// Average the gradients in `grads` across every rank of `collective`.
pub fn all_reduce_gradients<B, M, C>(
    collective: &C,
    model: &M,
    grads: &mut GradientsParams,
) -> TrainResult<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    C: Collective + ?Sized,
{
    if collective.world_size() <= 1 {
        return Ok(());
    }
    let mut flatten = Flatten {
        grads,
        slots: Vec::new(),
        values: Vec::new(),
        error: None,
    };
    model.visit(&mut flatten);
    if let Some(err) = flatten.error {
        return Err(err);
    }
    let Flatten {
        slots, mut values, ..
    } = flatten;

    collective.all_reduce_mean(&mut values)?;

    let mut scatter = Scatter {
        grads,
        slots: slots.iter(),
        values: &values,
    };
    model.visit(&mut scatter);
    Ok(())
}

struct ParamFlatten {
    values: Vec<f32>,
    error: Option<TrainError>,
}

impl<B: Backend> ModuleVisitor<B> for ParamFlatten {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        match tensor.to_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => self.values.extend(values),
            Err(err) => self.error = Some(TrainError::tensor_data(err)),
        }
    }
}

struct ParamAssign<'a> {
    values: &'a [f32],
    cursor: usize,
}

impl<B: Backend> ModuleMapper<B> for ParamAssign<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let shape = tensor.dims();
        let len: usize = shape.iter().product();
        let Some(values) = self.values.get(self.cursor..self.cursor + len) else {
            return tensor;
        };
        self.cursor += len;
        let require_grad = tensor.is_require_grad();
        Tensor::<B, D>::from_data(TensorData::new(values.to_vec(), shape), &tensor.device())
            .set_require_grad(require_grad)
    }
}

/// Overwrite every float tensor of `model` (parameters and running statistics) with the values
/// held by rank `root`, so all workers start from identical weights.
pub fn broadcast_parameters<B, M, C>(collective: &C, model: M, root: usize) -> TrainResult<M>
where
    B: Backend,
    M: Module<B>,
    C: Collective + ?Sized,
{
    if collective.world_size() <= 1 {
        return Ok(model);
    }
    let mut flatten = ParamFlatten {
        values: Vec::new(),
        error: None,
    };
    model.visit(&mut flatten);
    if let Some(err) = flatten.error {
        return Err(err);
    }
    let mut values = flatten.values;
    collective.broadcast(&mut values, root)?;
    Ok(model.map(&mut ParamAssign {
        values: &values,
        cursor: 0,
    }))
}

/// Wraps a Burn optimizer so that its step first averages gradients across workers.
pub struct DistributedOptimizer<O, C: Collective = SingleProcess> {
    inner: O,
    collective: C,
}

impl<O, C: Collective> DistributedOptimizer<O, C> {
    pub fn new(inner: O, collective: C) -> Self {
        Self { inner, collective }
    }

    pub fn collective(&self) -> &C {
        &self.collective
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }

    /// Average `grads` across ranks in place.
    pub fn synchronize<B, M>(&self, model: &M, grads: &mut GradientsParams) -> TrainResult<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        all_reduce_gradients::<B, M, C>(&self.collective, model, grads)
    }

    /// Synchronize, then apply the inner optimizer.
    pub fn step<B, M>(&mut self, lr: f64, model: M, mut grads: GradientsParams) -> TrainResult<M>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.synchronize::<B, M>(&model, &mut grads)?;
        Ok(self.inner.step(lr, model, grads))
    }

    /// Apply the inner optimizer to gradients already passed through
    /// [`DistributedOptimizer::synchronize`].
    pub fn step_synchronized<B, M>(&mut self, lr: f64, model: M, grads: GradientsParams) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.inner.step(lr, model, grads)
    }
}
