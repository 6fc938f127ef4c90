//! Training hooks.
//!
//! A [`TrainingCallback`] is handed a read-only [`TrainingState`] at the start
//! of training, after every step and at the end. Two monitors ship with the
//! crate: [`DistanceCallback`] tracks held-out prediction error and
//! [`OrthonormalityCallback`] tracks how far the basis is from orthonormal.

use candle_core::{DType, Device, Tensor};

use crate::dataset::{Dataset, FunctionBatch};
use crate::error::{EncoderError, EncoderResult};
use crate::inner_product::DataType;
use crate::model::FunctionEncoder;
use crate::solver::{identity, RepresentationOptions};

/// Scalar losses of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    /// Loss that was backpropagated
    pub total: f32,
    /// Mean squared distance between predictions and query outputs
    pub prediction: f32,
    /// Gram-diagonal penalty, least-squares mode only
    pub orthonormality: Option<f32>,
    /// Average-function loss, residual method only
    pub average_function: Option<f32>,
    /// Gradient norm before clipping, set on steps that updated parameters
    pub grad_norm: Option<f32>,
}

/// What a callback can see.
#[derive(Debug)]
pub struct TrainingState<'a> {
    /// The encoder being trained
    pub encoder: &'a FunctionEncoder,
    /// Steps completed so far
    pub epoch: usize,
    /// Steps requested
    pub epochs: usize,
    /// Losses of the step just taken; `None` before the first step
    pub losses: Option<&'a StepLosses>,
    /// Batch of the step just taken; `None` before the first step
    pub batch: Option<&'a FunctionBatch>,
    /// Total loss of every completed step
    pub loss_history: &'a [f32],
}

/// Hooks invoked by [`FunctionEncoder::train_model`].
pub trait TrainingCallback {
    /// Called once before the first step.
    ///
    /// # Errors
    ///
    /// An error aborts training.
    fn on_training_start(&mut self, _state: &TrainingState<'_>) -> EncoderResult<()> {
        Ok(())
    }

    /// Called after every step.
    ///
    /// # Errors
    ///
    /// An error aborts training.
    fn on_step(&mut self, _state: &TrainingState<'_>) -> EncoderResult<()> {
        Ok(())
    }

    /// Called once after the last step.
    ///
    /// # Errors
    ///
    /// An error is returned from training after all steps ran.
    fn on_training_end(&mut self, _state: &TrainingState<'_>) -> EncoderResult<()> {
        Ok(())
    }
}

/// Runs several callbacks in order.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback.
    #[must_use]
    pub fn with(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Append a boxed callback.
    pub fn push(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Number of callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// True when no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl std::fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

impl TrainingCallback for CallbackList {
    fn on_training_start(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        self.callbacks.iter_mut().try_for_each(|cb| cb.on_training_start(state))
    }

    fn on_step(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        self.callbacks.iter_mut().try_for_each(|cb| cb.on_step(state))
    }

    fn on_training_end(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        self.callbacks.iter_mut().try_for_each(|cb| cb.on_training_end(state))
    }
}

/// Mean squared prediction distance on batches from a held-out dataset.
pub struct DistanceCallback<D> {
    dataset: D,
    log_freq: usize,
    options: RepresentationOptions,
    history: Vec<(usize, f32)>,
}

impl<D: Dataset> DistanceCallback<D> {
    /// Evaluate on `dataset` every `log_freq` steps (and before training).
    #[must_use]
    pub fn new(dataset: D, log_freq: usize) -> Self {
        Self {
            dataset,
            log_freq: log_freq.max(1),
            options: RepresentationOptions::default(),
            history: Vec::new(),
        }
    }

    /// `(epoch, mean squared distance)` for every evaluation so far.
    pub fn history(&self) -> &[(usize, f32)] {
        &self.history
    }

    fn evaluate(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        let encoder = state.encoder;
        let batch = self.dataset.sample()?;
        batch.validate(self.dataset.input_size(), self.dataset.output_size())?;
        let device = encoder.device();
        let y_hats = encoder.predict_from_examples(
            &batch.example_xs.to_device(device)?,
            &batch.example_ys.to_device(device)?,
            &batch.query_xs.to_device(device)?,
            &self.options,
        )?;
        let distance = encoder
            .data_type()
            .distance(&y_hats, &batch.query_ys.to_device(device)?, true)?
            .mean_all()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        tracing::info!(epoch = state.epoch, distance, "held-out mean squared distance");
        self.history.push((state.epoch, distance));
        Ok(())
    }
}

impl<D: Dataset> TrainingCallback for DistanceCallback<D> {
    fn on_training_start(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        if self.history.is_empty() {
            self.evaluate(state)?;
        }
        Ok(())
    }

    fn on_step(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        if state.epoch % self.log_freq == 0 {
            self.evaluate(state)?;
        }
        Ok(())
    }
}

/// Frobenius distance between the basis Gram matrix and the identity,
/// integrated on an even grid over a 1-D input range.
#[derive(Debug, Clone)]
pub struct OrthonormalityCallback {
    range: (f64, f64),
    n_points: usize,
    log_freq: usize,
    history: Vec<(usize, f32)>,
}

impl OrthonormalityCallback {
    /// Grid of `n_points` over `range`, evaluated every `log_freq` steps.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for an empty range or grid.
    pub fn new(range: (f64, f64), n_points: usize, log_freq: usize) -> EncoderResult<Self> {
        if !(range.0 < range.1) || n_points == 0 {
            return Err(EncoderError::precondition(format!(
                "orthonormality grid needs lo < hi and at least one point, got {range:?} with {n_points}"
            )));
        }
        Ok(Self {
            range,
            n_points,
            log_freq: log_freq.max(1),
            history: Vec::new(),
        })
    }

    /// `(epoch, ‖G - I‖_F)` for every evaluation so far.
    pub fn history(&self) -> &[(usize, f32)] {
        &self.history
    }

    fn grid(&self, device: &Device) -> EncoderResult<Tensor> {
        let (lo, hi) = self.range;
        let step = (hi - lo) / self.n_points as f64;
        let points: Vec<f32> = (0..self.n_points)
            .map(|i| (lo + step * (i as f64 + 0.5)) as f32)
            .collect();
        Ok(Tensor::from_vec(points, (1, self.n_points, 1), device)?)
    }

    fn evaluate(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        let encoder = state.encoder;
        if encoder.config().input_size != [1] {
            return Err(EncoderError::precondition(
                "orthonormality monitoring needs a 1-D input size",
            ));
        }
        let gs = encoder.forward_basis_functions(&self.grid(encoder.device())?)?;
        let volume = self.range.1 - self.range.0;
        let gram = (DataType::Deterministic.inner_product(&gs, &gs)? * volume)?.squeeze(0)?;
        let k = gram.dim(0)?;
        let eye = identity(k, gram.dtype(), gram.device())?;
        let error = (gram - eye)?
            .sqr()?
            .sum_all()?
            .sqrt()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        tracing::info!(epoch = state.epoch, error, "basis orthonormality error");
        self.history.push((state.epoch, error));
        Ok(())
    }
}

impl TrainingCallback for OrthonormalityCallback {
    fn on_training_start(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        self.evaluate(state)
    }

    fn on_step(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        if state.epoch % self.log_freq == 0 {
            self.evaluate(state)?;
        }
        Ok(())
    }

    fn on_training_end(&mut self, state: &TrainingState<'_>) -> EncoderResult<()> {
        if self.history.last().map(|(epoch, _)| *epoch) != Some(state.epoch) {
            self.evaluate(state)?;
        }
        Ok(())
    }
}
