//! Fully connected basis network.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::{dense_stack_params, flatten_points, Activation, Architecture, Role};
use crate::error::{EncoderError, EncoderResult};
use crate::norm::{manual_layer_norm, ManualLayerNorm};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Hyper-parameters of an [`Mlp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Width of every hidden layer
    pub hidden_size: usize,
    /// Number of linear layers, at least 2
    pub n_layers: usize,
    /// Nonlinearity after each hidden layer
    #[serde(default)]
    pub activation: Activation,
    /// Normalize each hidden layer before the activation
    #[serde(default)]
    pub layer_norm: bool,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self::new(256, 4)
    }
}

impl MlpConfig {
    /// ReLU network without normalization.
    #[must_use]
    pub const fn new(hidden_size: usize, n_layers: usize) -> Self {
        Self {
            hidden_size,
            n_layers,
            activation: Activation::Relu,
            layer_norm: false,
        }
    }

    /// Set the activation.
    #[must_use]
    pub const fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Enable or disable hidden-layer normalization.
    #[must_use]
    pub const fn with_layer_norm(mut self, layer_norm: bool) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    pub(crate) fn validate(&self) -> EncoderResult<()> {
        if self.n_layers < 2 {
            return Err(EncoderError::precondition(format!(
                "MLP needs at least 2 layers, got {}",
                self.n_layers
            )));
        }
        if self.hidden_size == 0 {
            return Err(EncoderError::precondition("MLP hidden size must be positive"));
        }
        Ok(())
    }

    /// Parameters of one network mapping `input` features to `output`.
    #[must_use]
    pub const fn predict_number_params(&self, input: usize, output: usize) -> usize {
        let mut n = dense_stack_params(input, self.hidden_size, output, self.n_layers);
        if self.layer_norm {
            n += 2 * self.hidden_size * (self.n_layers - 1);
        }
        n
    }
}

/// Multi-layer perceptron applied to every datapoint independently.
#[derive(Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
    norms: Vec<ManualLayerNorm>,
    activation: Activation,
    output_size: usize,
    role: Role,
}

impl Mlp {
    /// Build the network for `input`-dimensional points and `m` outputs.
    pub fn new(
        config: &MlpConfig,
        input: usize,
        m: usize,
        role: Role,
        vb: VarBuilder,
    ) -> EncoderResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let mut layers = Vec::with_capacity(config.n_layers);
        let mut norms = Vec::new();

        let mut in_features = input;
        for i in 0..config.n_layers - 1 {
            layers.push(linear(in_features, hidden, vb.pp(format!("layers.{i}")))?);
            if config.layer_norm {
                norms.push(manual_layer_norm(hidden, LAYER_NORM_EPS, vb.pp(format!("norms.{i}")))?);
            }
            in_features = hidden;
        }
        let last = config.n_layers - 1;
        layers.push(linear(hidden, role.out_features(m), vb.pp(format!("layers.{last}")))?);

        Ok(Self {
            layers,
            norms,
            activation: config.activation,
            output_size: m,
            role,
        })
    }
}

impl Architecture for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (mut hidden, f, d) = flatten_points(xs)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                if let Some(norm) = self.norms.get(i) {
                    hidden = norm.forward(&hidden)?;
                }
                hidden = self.activation.apply(&hidden)?;
            }
        }
        self.role.shape_outputs(&hidden, f, d, self.output_size)
    }

    fn role(&self) -> Role {
        self.role
    }
}
