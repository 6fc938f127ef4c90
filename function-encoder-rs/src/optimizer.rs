//! Optimizers, gradient accumulation and global-norm clipping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, EncoderResult};

/// Which update rule to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam (AdamW with zero weight decay)
    #[default]
    Adam,
    /// Adam with decoupled weight decay
    AdamW,
    /// Plain stochastic gradient descent
    Sgd,
}

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Update rule
    #[serde(default)]
    pub kind: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay, only used by AdamW
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Adam with the given learning rate.
    #[must_use]
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    /// AdamW with the given learning rate and weight decay.
    #[must_use]
    pub fn adamw(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate,
            weight_decay,
            ..Self::default()
        }
    }

    /// SGD with the given learning rate.
    #[must_use]
    pub fn sgd(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> EncoderResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(EncoderError::precondition(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(EncoderError::precondition(format!(
                "Adam betas must lie in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.eps <= 0.0 || self.weight_decay < 0.0 {
            return Err(EncoderError::precondition(format!(
                "eps must be positive and weight decay non-negative, got eps {} and decay {}",
                self.eps, self.weight_decay
            )));
        }
        if self.kind == OptimizerKind::Adam && self.weight_decay != 0.0 {
            return Err(EncoderError::precondition(
                "Adam takes no weight decay; use AdamW instead",
            ));
        }
        Ok(())
    }

    /// Build the optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if candle rejects the parameters.
    pub fn build(&self, vars: Vec<Var>) -> EncoderResult<EncoderOptimizer> {
        let optimizer = match self.kind {
            OptimizerKind::Adam | OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: self.learning_rate,
                    beta1: self.beta1,
                    beta2: self.beta2,
                    eps: self.eps,
                    weight_decay: match self.kind {
                        OptimizerKind::Adam => 0.0,
                        _ => self.weight_decay,
                    },
                };
                EncoderOptimizer::AdamW(candle_nn::AdamW::new(vars, params)?)
            }
            OptimizerKind::Sgd => EncoderOptimizer::Sgd(SGD::new(vars, self.learning_rate)?),
        };
        Ok(optimizer)
    }
}

/// The optimizer owned by a [`FunctionEncoder`](crate::FunctionEncoder).
#[derive(Debug)]
pub enum EncoderOptimizer {
    /// Adam or AdamW
    AdamW(candle_nn::AdamW),
    /// SGD
    Sgd(SGD),
}

impl EncoderOptimizer {
    /// Apply one update from `grads`.
    ///
    /// # Errors
    ///
    /// Propagates tensor failures from the update.
    pub fn step(&mut self, grads: &GradStore) -> EncoderResult<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads)?,
            Self::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Set the learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Sums gradients over several backward passes.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    grads: Option<GradStore>,
    pending: usize,
}

impl GradientAccumulator {
    /// Empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backward passes accumulated since the last reset.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Add the gradients of `grads` for every var in `vars`.
    ///
    /// Only the var entries are kept; gradients of constant leaves such as
    /// the batch inputs are dropped with `grads`.
    ///
    /// # Errors
    ///
    /// Propagates tensor failures from the addition.
    pub fn accumulate(&mut self, grads: GradStore, vars: &[Var]) -> EncoderResult<()> {
        self.pending += 1;
        let Some(store) = self.grads.as_mut() else {
            self.grads = Some(var_store(&grads, vars)?);
            return Ok(());
        };
        for var in vars {
            let Some(new) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sum = match store.get(var.as_tensor()) {
                Some(old) => (old + new)?,
                None => new.clone(),
            };
            store.insert(var.as_tensor(), sum);
        }
        Ok(())
    }

    /// Global L2 norm of the accumulated gradients over `vars`.
    ///
    /// # Errors
    ///
    /// Propagates tensor failures.
    pub fn global_norm(&self, vars: &[Var]) -> EncoderResult<f32> {
        let Some(store) = self.grads.as_ref() else {
            return Ok(0.0);
        };
        let mut total = 0f32;
        for var in vars {
            if let Some(grad) = store.get(var.as_tensor()) {
                total += grad.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            }
        }
        Ok(total.sqrt())
    }

    /// Rescale the gradients so their global norm is at most `max_norm`.
    ///
    /// Returns the norm before clipping.
    ///
    /// # Errors
    ///
    /// Propagates tensor failures.
    pub fn clip(&mut self, vars: &[Var], max_norm: f64) -> EncoderResult<f32> {
        let norm = self.global_norm(vars)?;
        let coef = max_norm / (f64::from(norm) + 1e-6);
        if coef >= 1.0 {
            return Ok(norm);
        }
        tracing::warn!(norm, max_norm, "clipping gradients");
        if let Some(store) = self.grads.as_mut() {
            for var in vars {
                let scaled = match store.get(var.as_tensor()) {
                    Some(grad) => (grad * coef)?,
                    None => continue,
                };
                store.insert(var.as_tensor(), scaled);
            }
        }
        Ok(norm)
    }

    /// Step `optimizer` with the accumulated gradients and reset.
    ///
    /// # Errors
    ///
    /// Propagates optimizer failures.
    pub fn apply(&mut self, optimizer: &mut EncoderOptimizer) -> EncoderResult<()> {
        if let Some(store) = self.grads.take() {
            optimizer.step(&store)?;
        }
        self.pending = 0;
        Ok(())
    }

    /// Drop accumulated gradients without stepping.
    pub fn reset(&mut self) {
        self.grads = None;
        self.pending = 0;
    }
}

/// A store holding only the gradients `grads` has for `vars`.
fn var_store(grads: &GradStore, vars: &[Var]) -> EncoderResult<GradStore> {
    // GradStore has no public constructor; an untracked scalar's backward
    // pass yields a store whose only entry is that scalar.
    let device = match vars.first() {
        Some(var) => var.device().clone(),
        None => candle_core::Device::Cpu,
    };
    let mut store = Tensor::zeros((), DType::F32, &device)?.backward()?;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            store.insert(var.as_tensor(), grad.clone());
        }
    }
    Ok(store)
}

/// Convenience for a fresh backward pass.
pub(crate) fn backward(loss: &Tensor) -> EncoderResult<GradStore> {
    Ok(loss.backward()?)
}
