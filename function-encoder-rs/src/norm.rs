//! Layer normalization for hidden layers of basis networks.
//!
//! Written with elementary tensor ops (mean, variance, broadcast arithmetic)
//! so it differentiates on every backend candle supports.

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

/// LayerNorm over the last axis with a learned scale and shift.
#[derive(Debug, Clone)]
pub struct ManualLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl ManualLayerNorm {
    /// Wrap existing scale and shift tensors.
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Width of the normalized axis.
    pub fn normalized_shape(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Module for ManualLayerNorm {
    /// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Create a layer norm with `weight = 1` and `bias = 0`; `2 * size`
/// parameters.
pub fn manual_layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<ManualLayerNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
    Ok(ManualLayerNorm::new(weight, bias, eps))
}
