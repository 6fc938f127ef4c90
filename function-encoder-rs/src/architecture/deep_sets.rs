//! Learned set encoder mapping example pairs straight to coefficients.
//!
//! `ρ(aggregate_d φ([x_d, y_d]))`: every example pair is embedded by `φ`,
//! the embeddings are pooled over the datapoint axis, and `ρ` maps the pooled
//! vector to the `K` coefficients.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::{dense_stack_params, Activation};
use crate::error::{EncoderError, EncoderResult};

/// Pooling over the datapoint axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Average embedding
    #[default]
    Mean,
    /// Summed embedding
    Sum,
    /// Elementwise maximum
    Max,
    /// Softmax-weighted sum with a learned score per point
    Attention,
}

/// Hyper-parameters of a [`DeepSetsEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepSetsConfig {
    /// Width of `φ` and of the pooled embedding
    pub phi_hidden_size: usize,
    /// Linear layers in `φ`
    pub phi_n_layers: usize,
    /// Width of `ρ`
    pub rho_hidden_size: usize,
    /// Linear layers in `ρ`
    pub rho_n_layers: usize,
    /// Nonlinearity inside both networks
    #[serde(default)]
    pub activation: Activation,
    /// Pooling over datapoints
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl Default for DeepSetsConfig {
    fn default() -> Self {
        Self {
            phi_hidden_size: 128,
            phi_n_layers: 3,
            rho_hidden_size: 128,
            rho_n_layers: 3,
            activation: Activation::Relu,
            aggregation: Aggregation::Mean,
        }
    }
}

impl DeepSetsConfig {
    /// Set the pooling.
    #[must_use]
    pub const fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Set both networks' width and depth.
    #[must_use]
    pub const fn with_layers(mut self, hidden_size: usize, n_layers: usize) -> Self {
        self.phi_hidden_size = hidden_size;
        self.phi_n_layers = n_layers;
        self.rho_hidden_size = hidden_size;
        self.rho_n_layers = n_layers;
        self
    }

    pub(crate) fn validate(&self) -> EncoderResult<()> {
        if self.phi_n_layers == 0 || self.rho_n_layers == 0 {
            return Err(EncoderError::precondition(
                "deep sets encoder needs at least one layer in phi and rho",
            ));
        }
        if self.phi_hidden_size == 0 || self.rho_hidden_size == 0 {
            return Err(EncoderError::precondition(
                "deep sets encoder hidden sizes must be positive",
            ));
        }
        Ok(())
    }

    /// Parameters for `φ`, `ρ` and the optional attention score layer.
    #[must_use]
    pub fn predict_number_params(
        &self,
        input_size: &[usize],
        output_size: &[usize],
        n_basis: usize,
    ) -> usize {
        let phi_in = input_size.iter().product::<usize>() + output_size.iter().product::<usize>();
        let embed = self.phi_hidden_size;
        let phi = dense_stack_params(phi_in, embed, embed, self.phi_n_layers);
        let rho = dense_stack_params(embed, self.rho_hidden_size, n_basis, self.rho_n_layers);
        let score = match self.aggregation {
            Aggregation::Attention => embed + 1,
            _ => 0,
        };
        phi + rho + score
    }
}

/// Deep Sets representation encoder.
#[derive(Debug)]
pub struct DeepSetsEncoder {
    phi: Vec<Linear>,
    rho: Vec<Linear>,
    score: Option<Linear>,
    activation: Activation,
    aggregation: Aggregation,
}

impl DeepSetsEncoder {
    /// Build `φ`, `ρ` and, for attention pooling, the score layer.
    pub fn new(
        config: &DeepSetsConfig,
        input_size: &[usize],
        output_size: &[usize],
        n_basis: usize,
        vb: VarBuilder,
    ) -> EncoderResult<Self> {
        config.validate()?;
        let phi_in = input_size.iter().product::<usize>() + output_size.iter().product::<usize>();
        let embed = config.phi_hidden_size;
        let phi = dense_stack(phi_in, embed, embed, config.phi_n_layers, vb.pp("phi"))?;
        let rho = dense_stack(
            embed,
            config.rho_hidden_size,
            n_basis,
            config.rho_n_layers,
            vb.pp("rho"),
        )?;
        let score = match config.aggregation {
            Aggregation::Attention => Some(linear(embed, 1, vb.pp("score"))?),
            _ => None,
        };
        Ok(Self {
            phi,
            rho,
            score,
            activation: config.activation,
            aggregation: config.aggregation,
        })
    }

    /// Coefficients `(F, K)` from `example_xs: (F, D, *input)` and
    /// `example_ys: (F, D, *output)`.
    pub fn forward(&self, example_xs: &Tensor, example_ys: &Tensor) -> candle_core::Result<Tensor> {
        let (f, d) = (example_xs.dim(0)?, example_xs.dim(1)?);
        let xs = example_xs.reshape((f, d, ()))?;
        let ys = example_ys.reshape((f, d, ()))?;
        let pairs = Tensor::cat(&[&xs, &ys], D::Minus1)?;

        let embedded = self.run(&self.phi, &pairs)?;
        let pooled = match self.aggregation {
            Aggregation::Mean => embedded.mean(1)?,
            Aggregation::Sum => embedded.sum(1)?,
            Aggregation::Max => embedded.max(1)?,
            Aggregation::Attention => {
                let Some(score) = &self.score else {
                    candle_core::bail!("attention pooling built without a score layer");
                };
                let weights = candle_nn::ops::softmax(&score.forward(&embedded)?, 1)?;
                embedded.broadcast_mul(&weights)?.sum(1)?
            }
        };
        self.run(&self.rho, &pooled)
    }

    fn run(&self, layers: &[Linear], xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        let last = layers.len() - 1;
        for (i, layer) in layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                hidden = self.activation.apply(&hidden)?;
            }
        }
        Ok(hidden)
    }
}

fn dense_stack(
    input: usize,
    hidden: usize,
    output: usize,
    n_layers: usize,
    vb: VarBuilder,
) -> candle_core::Result<Vec<Linear>> {
    if n_layers == 1 {
        return Ok(vec![linear(input, output, vb.pp("0"))?]);
    }
    let mut layers = Vec::with_capacity(n_layers);
    let mut in_features = input;
    for i in 0..n_layers - 1 {
        layers.push(linear(in_features, hidden, vb.pp(i.to_string()))?);
        in_features = hidden;
    }
    layers.push(linear(hidden, output, vb.pp((n_layers - 1).to_string()))?);
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &DeepSetsConfig, var_map: &VarMap) -> DeepSetsEncoder {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu);
        DeepSetsEncoder::new(config, &[2], &[1], 6, vb).unwrap()
    }

    #[test]
    fn test_every_aggregation_shape_and_count() {
        let device = Device::Cpu;
        let xs = Tensor::randn(0.0f32, 1.0, (3, 10, 2), &device).unwrap();
        let ys = Tensor::randn(0.0f32, 1.0, (3, 10, 1), &device).unwrap();
        for aggregation in [
            Aggregation::Mean,
            Aggregation::Sum,
            Aggregation::Max,
            Aggregation::Attention,
        ] {
            for n_layers in [1, 2, 3] {
                let config = DeepSetsConfig::default()
                    .with_layers(12, n_layers)
                    .with_aggregation(aggregation);
                let var_map = VarMap::new();
                let encoder = build(&config, &var_map);
                assert_eq!(encoder.forward(&xs, &ys).unwrap().dims(), &[3, 6]);
                let n: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
                assert_eq!(
                    n,
                    config.predict_number_params(&[2], &[1], 6),
                    "{aggregation:?} x {n_layers}"
                );
            }
        }
    }

    #[test]
    fn test_permutation_invariant() {
        let device = Device::Cpu;
        let config = DeepSetsConfig::default().with_layers(8, 2);
        let var_map = VarMap::new();
        let encoder = build(&config, &var_map);

        let xs = Tensor::new(&[[[0.1f32, 0.2], [0.3, -0.4], [1.0, 0.0]]], &device).unwrap();
        let ys = Tensor::new(&[[[1.0f32], [2.0], [3.0]]], &device).unwrap();
        let xs_rev = Tensor::new(&[[[1.0f32, 0.0], [0.3, -0.4], [0.1, 0.2]]], &device).unwrap();
        let ys_rev = Tensor::new(&[[[3.0f32], [2.0], [1.0]]], &device).unwrap();

        let a = encoder.forward(&xs, &ys).unwrap().to_vec2::<f32>().unwrap();
        let b = encoder.forward(&xs_rev, &ys_rev).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
