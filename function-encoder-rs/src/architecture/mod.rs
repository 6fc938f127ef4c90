//! Trainable networks used as basis functions, average functions and
//! representation encoders.
//!
//! A basis network maps `(F, D, *input)` to `(F, D, M, K)`; the same network
//! built in the [`Role::Average`] role maps to `(F, D, M)`. Every variant of
//! [`ModelType`] knows its own closed-form parameter count so an assembled
//! encoder can be checked against it at construction time.

mod cnn;
mod deep_sets;
mod euclidean;
mod mlp;
mod parallel_mlp;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, EncoderResult};

pub use cnn::{Cnn, CnnConfig};
pub use deep_sets::{Aggregation, DeepSetsConfig, DeepSetsEncoder};
pub use euclidean::Euclidean;
pub use mlp::{Mlp, MlpConfig};
pub use parallel_mlp::{ParallelMlp, ParallelMlpConfig};

/// A network evaluated pointwise over a batch of functions.
pub trait Architecture: std::fmt::Debug {
    /// Evaluate at `xs: (F, D, *input)`.
    ///
    /// Returns `(F, D, M, K)` in the basis role and `(F, D, M)` in the
    /// average role.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor>;

    /// The role this network was built for.
    fn role(&self) -> Role;
}

/// What a network's outputs are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `K` basis functions, one output per (output dimension, basis) pair.
    Basis {
        /// Number of basis functions `K`.
        n_basis: usize,
    },
    /// A single function subtracted before fitting the basis.
    Average,
}

impl Role {
    /// Width of the final layer for an output dimension of `m`.
    #[must_use]
    pub const fn out_features(self, m: usize) -> usize {
        match self {
            Self::Basis { n_basis } => m * n_basis,
            Self::Average => m,
        }
    }

    /// Reshape `(F * D, out_features)` network outputs into the role's layout.
    pub(crate) fn shape_outputs(
        self,
        outs: &Tensor,
        f: usize,
        d: usize,
        m: usize,
    ) -> candle_core::Result<Tensor> {
        match self {
            Self::Basis { n_basis } => outs.reshape((f, d, m, n_basis)),
            Self::Average => outs.reshape((f, d, m)),
        }
    }
}

/// Pointwise nonlinearity between hidden layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `max(x, 0)`
    #[default]
    Relu,
    /// Hyperbolic tangent
    Tanh,
    /// Logistic sigmoid
    Sigmoid,
    /// Gaussian error linear unit
    Gelu,
    /// Leaky ReLU with slope 0.01
    LeakyRelu,
}

impl Activation {
    /// Apply the activation elementwise.
    pub fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Tanh => xs.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
            Self::Gelu => xs.gelu(),
            Self::LeakyRelu => candle_nn::ops::leaky_relu(xs, 0.01),
        }
    }
}

/// Architecture used for the basis (and average) networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelType {
    /// Fully connected network over 1-D inputs.
    Mlp(MlpConfig),
    /// One small MLP per basis function, evaluated as a batch.
    ParallelMlp(ParallelMlpConfig),
    /// Input-independent basis vectors.
    Euclidean,
    /// Convolutional feature extractor over `[C, H, W]` images.
    Cnn(CnnConfig),
}

impl Default for ModelType {
    fn default() -> Self {
        Self::Mlp(MlpConfig::default())
    }
}

impl ModelType {
    /// Short name used in logs and hyper-parameter maps.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mlp(_) => "MLP",
            Self::ParallelMlp(_) => "ParallelMLP",
            Self::Euclidean => "Euclidean",
            Self::Cnn(_) => "CNN",
        }
    }

    /// Check the architecture against the encoder's input shape.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for unsupported input ranks or
    /// degenerate layer settings.
    pub fn validate(&self, input_size: &[usize]) -> EncoderResult<()> {
        match self {
            Self::Mlp(config) => {
                require_vector_input(self.name(), input_size)?;
                config.validate()
            }
            Self::ParallelMlp(config) => {
                require_vector_input(self.name(), input_size)?;
                config.validate()
            }
            Self::Euclidean => Ok(()),
            Self::Cnn(config) => config.validate(input_size),
        }
    }

    /// Closed-form parameter count of one network in the given role.
    #[must_use]
    pub fn predict_number_params(
        &self,
        input_size: &[usize],
        output_size: &[usize],
        role: Role,
    ) -> usize {
        let m = output_size.iter().product();
        match self {
            Self::Mlp(config) => config.predict_number_params(input_size[0], role.out_features(m)),
            Self::ParallelMlp(config) => config.predict_number_params(input_size[0], m, role),
            Self::Euclidean => role.out_features(m),
            Self::Cnn(config) => config.predict_number_params(input_size, role.out_features(m)),
        }
    }

    /// Build one network in the given role, registering its parameters
    /// under `vb`.
    ///
    /// # Errors
    ///
    /// Propagates validation and allocation failures.
    pub fn build(
        &self,
        input_size: &[usize],
        output_size: &[usize],
        role: Role,
        vb: VarBuilder,
    ) -> EncoderResult<Box<dyn Architecture>> {
        self.validate(input_size)?;
        let m = output_size.iter().product();
        let network: Box<dyn Architecture> = match self {
            Self::Mlp(config) => Box::new(Mlp::new(config, input_size[0], m, role, vb)?),
            Self::ParallelMlp(config) => {
                Box::new(ParallelMlp::new(config, input_size[0], m, role, vb)?)
            }
            Self::Euclidean => Box::new(Euclidean::new(m, role, vb)?),
            Self::Cnn(config) => Box::new(Cnn::new(config, input_size, m, role, vb)?),
        };
        Ok(network)
    }
}

fn require_vector_input(name: &str, input_size: &[usize]) -> EncoderResult<()> {
    if input_size.len() != 1 {
        return Err(EncoderError::precondition(format!(
            "{name} only supports 1-D inputs, got input size {input_size:?}"
        )));
    }
    Ok(())
}

/// Parameter count of a fully connected stack.
///
/// `n_layers` counts linear layers, so `n_layers - 1` hidden activations.
/// A single layer maps `input` straight to `output`.
pub(crate) const fn dense_stack_params(
    input: usize,
    hidden: usize,
    output: usize,
    n_layers: usize,
) -> usize {
    if n_layers <= 1 {
        return (input + 1) * output;
    }
    (input + 1) * hidden + (n_layers - 2) * (hidden + 1) * hidden + (hidden + 1) * output
}

/// Flatten `(F, D, *rest)` into `(F * D, prod(rest))`.
pub(crate) fn flatten_points(xs: &Tensor) -> candle_core::Result<(Tensor, usize, usize)> {
    let dims = xs.dims();
    if dims.len() < 3 {
        candle_core::bail!("expected inputs of shape (f, d, *input), got {dims:?}");
    }
    let (f, d) = (dims[0], dims[1]);
    let rest: usize = dims[2..].iter().product();
    Ok((xs.reshape((f * d, rest))?, f, d))
}
