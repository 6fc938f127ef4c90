//! Independent per-basis MLPs evaluated as one batched network.
//!
//! Each basis function owns its own small MLP mapping the input to `M`
//! outputs. Weights are stacked along a leading parallel axis so all `K`
//! networks run as a single batched matmul per layer.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use super::{dense_stack_params, flatten_points, Activation, Architecture, Role};
use crate::error::{EncoderError, EncoderResult};

/// Hyper-parameters of a [`ParallelMlp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMlpConfig {
    /// Hidden width of each member network
    pub hidden_size: usize,
    /// Linear layers per member network, at least 2
    pub n_layers: usize,
    /// Nonlinearity after each hidden layer
    #[serde(default)]
    pub activation: Activation,
}

impl Default for ParallelMlpConfig {
    fn default() -> Self {
        Self::new(256, 4)
    }
}

impl ParallelMlpConfig {
    /// ReLU members with the given width and depth.
    #[must_use]
    pub const fn new(hidden_size: usize, n_layers: usize) -> Self {
        Self {
            hidden_size,
            n_layers,
            activation: Activation::Relu,
        }
    }

    /// Set the activation.
    #[must_use]
    pub const fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub(crate) fn validate(&self) -> EncoderResult<()> {
        if self.n_layers < 2 {
            return Err(EncoderError::precondition(format!(
                "ParallelMLP needs at least 2 layers, got {}",
                self.n_layers
            )));
        }
        if self.hidden_size == 0 {
            return Err(EncoderError::precondition("ParallelMLP hidden size must be positive"));
        }
        Ok(())
    }

    /// Parameters of all member networks for `m` outputs each.
    #[must_use]
    pub const fn predict_number_params(&self, input: usize, m: usize, role: Role) -> usize {
        n_parallel(role) * dense_stack_params(input, self.hidden_size, m, self.n_layers)
    }
}

const fn n_parallel(role: Role) -> usize {
    match role {
        Role::Basis { n_basis } => n_basis,
        Role::Average => 1,
    }
}

/// `P` linear layers applied side by side.
#[derive(Debug, Clone)]
struct ParallelLinear {
    /// `(P, out, in)`
    weight: Tensor,
    /// `(P, out)`
    bias: Tensor,
}

impl ParallelLinear {
    fn new(
        in_features: usize,
        out_features: usize,
        n_parallel: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let bound = 1.0 / (in_features as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((n_parallel, out_features, in_features), "weight", init)?;
        let bias = vb.get_with_hints((n_parallel, out_features), "bias", init)?;
        Ok(Self { weight, bias })
    }

    /// `(P, N, in)` to `(P, N, out)`.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let w_t = self.weight.transpose(1, 2)?.contiguous()?;
        xs.matmul(&w_t)?.broadcast_add(&self.bias.unsqueeze(1)?)
    }
}

/// Stack of independent MLPs, one per basis function.
#[derive(Debug)]
pub struct ParallelMlp {
    layers: Vec<ParallelLinear>,
    activation: Activation,
    n_parallel: usize,
    output_size: usize,
    role: Role,
}

impl ParallelMlp {
    /// Build `K` member networks (or one in the average role).
    pub fn new(
        config: &ParallelMlpConfig,
        input: usize,
        m: usize,
        role: Role,
        vb: VarBuilder,
    ) -> EncoderResult<Self> {
        config.validate()?;
        let p = n_parallel(role);
        let hidden = config.hidden_size;
        let mut layers = Vec::with_capacity(config.n_layers);
        let mut in_features = input;
        for i in 0..config.n_layers - 1 {
            layers.push(ParallelLinear::new(in_features, hidden, p, vb.pp(format!("layers.{i}")))?);
            in_features = hidden;
        }
        let last = config.n_layers - 1;
        layers.push(ParallelLinear::new(hidden, m, p, vb.pp(format!("layers.{last}")))?);

        Ok(Self {
            layers,
            activation: config.activation,
            n_parallel: p,
            output_size: m,
            role,
        })
    }
}

impl Architecture for ParallelMlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (points, f, d) = flatten_points(xs)?;
        let (n, input) = points.dims2()?;
        let mut hidden = points
            .unsqueeze(0)?
            .broadcast_as((self.n_parallel, n, input))?
            .contiguous()?;

        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                hidden = self.activation.apply(&hidden)?;
            }
        }

        // (P, N, M) -> (N, M, P)
        let outs = hidden.permute((1, 2, 0))?.contiguous()?;
        match self.role {
            Role::Basis { n_basis } => outs.reshape((f, d, self.output_size, n_basis)),
            Role::Average => outs.reshape((f, d, self.output_size)),
        }
    }

    fn role(&self) -> Role {
        self.role
    }
}
