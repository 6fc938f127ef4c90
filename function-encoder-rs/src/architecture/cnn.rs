//! Convolutional basis network for fixed-size `[C, H, W]` images.

use candle_core::Tensor;
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::{dense_stack_params, Activation, Architecture, Role};
use crate::error::{EncoderError, EncoderResult};

const KERNEL: usize = 3;
const CONV_STAGES: usize = 3;

/// Hyper-parameters of a [`Cnn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CnnConfig {
    /// Width of the hidden layers of the fully connected head
    pub hidden_size: usize,
    /// Linear layers in the head, at least 2
    pub n_layers: usize,
    /// Nonlinearity after each hidden layer of the head
    #[serde(default)]
    pub activation: Activation,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self::new(256, 3)
    }
}

impl CnnConfig {
    /// ReLU network with the given head.
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

    pub(crate) fn validate(&self, input_size: &[usize]) -> EncoderResult<()> {
        let [channels, height, width] = *input_size else {
            return Err(EncoderError::precondition(format!(
                "CNN needs a [C, H, W] input size, got {input_size:?}"
            )));
        };
        if channels == 0 || channels > 4 {
            return Err(EncoderError::precondition(format!(
                "CNN supports 1 to 4 channels in CHW order, got {channels}"
            )));
        }
        let min_side = 1 << CONV_STAGES;
        if height < min_side || width < min_side {
            return Err(EncoderError::precondition(format!(
                "CNN images must be at least {min_side}x{min_side}, got {height}x{width}"
            )));
        }
        if self.n_layers < 2 || self.hidden_size == 0 {
            return Err(EncoderError::precondition(format!(
                "CNN head needs at least 2 layers of positive width, got {} x {}",
                self.n_layers, self.hidden_size
            )));
        }
        Ok(())
    }

    /// Parameters for an image of `input_size` and `output` head outputs.
    #[must_use]
    pub fn predict_number_params(&self, input_size: &[usize], output: usize) -> usize {
        let channels = input_size[0];
        let mut n = 0;
        let mut c_in = channels;
        for _ in 0..CONV_STAGES {
            let c_out = 2 * c_in;
            n += KERNEL * KERNEL * c_in * c_out + c_out;
            c_in = c_out;
        }
        n + dense_stack_params(flatten_size(input_size), self.hidden_size, output, self.n_layers)
    }
}

/// Features left after three 2x2 pooling stages.
fn flatten_size(input_size: &[usize]) -> usize {
    let (channels, height, width) = (input_size[0], input_size[1], input_size[2]);
    let shrink = 1 << CONV_STAGES;
    (channels << CONV_STAGES) * (height / shrink) * (width / shrink)
}

/// Three conv + max-pool stages (C to 2C to 4C to 8C) and an MLP head.
///
/// The conv stages are purely linear; only the head applies the activation.
#[derive(Debug)]
pub struct Cnn {
    convs: Vec<Conv2d>,
    head: Vec<Linear>,
    activation: Activation,
    input_size: [usize; 3],
    output_size: usize,
    role: Role,
}

impl Cnn {
    /// Build the network for `input_size` images and `m` outputs.
    pub fn new(
        config: &CnnConfig,
        input_size: &[usize],
        m: usize,
        role: Role,
        vb: VarBuilder,
    ) -> EncoderResult<Self> {
        config.validate(input_size)?;
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut convs = Vec::with_capacity(CONV_STAGES);
        let mut c_in = input_size[0];
        for i in 0..CONV_STAGES {
            convs.push(conv2d(c_in, 2 * c_in, KERNEL, conv_config, vb.pp(format!("convs.{i}")))?);
            c_in *= 2;
        }

        let hidden = config.hidden_size;
        let mut head = Vec::with_capacity(config.n_layers);
        let mut in_features = flatten_size(input_size);
        for i in 0..config.n_layers - 1 {
            head.push(linear(in_features, hidden, vb.pp(format!("head.{i}")))?);
            in_features = hidden;
        }
        let last = config.n_layers - 1;
        head.push(linear(hidden, role.out_features(m), vb.pp(format!("head.{last}")))?);

        Ok(Self {
            convs,
            head,
            activation: config.activation,
            input_size: [input_size[0], input_size[1], input_size[2]],
            output_size: m,
            role,
        })
    }
}

impl Cnn {
    /// Flattened conv features of `(N, C, H, W)` images.
    fn features(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden = images.clone();
        for conv in &self.convs {
            hidden = conv.forward(&hidden)?.max_pool2d(2)?;
        }
        hidden.flatten_from(1)
    }
}

impl Architecture for Cnn {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dims = xs.dims();
        if dims.len() != 5 || dims[2..] != self.input_size {
            candle_core::bail!(
                "expected images of shape (f, d, {:?}), got {dims:?}",
                self.input_size
            );
        }
        let (f, d) = (dims[0], dims[1]);
        let [c, h, w] = self.input_size;

        let mut hidden = self.features(&xs.reshape((f * d, c, h, w))?)?;

        let last = self.head.len() - 1;
        for (i, layer) in self.head.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                hidden = self.activation.apply(&hidden)?;
            }
        }
        self.role.shape_outputs(&hidden, f, d, self.output_size)
    }

    fn role(&self) -> Role {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_cnn_shapes_and_count() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let config = CnnConfig::new(16, 3);
        let cnn = Cnn::new(&config, &[2, 16, 12], 1, Role::Basis { n_basis: 4 }, vb).unwrap();

        let xs = Tensor::randn(0.0f32, 1.0, (2, 3, 2, 16, 12), &device).unwrap();
        assert_eq!(cnn.forward(&xs).unwrap().dims(), &[2, 3, 1, 4]);

        let n: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(n, config.predict_number_params(&[2, 16, 12], 4));
    }

    #[test]
    fn test_conv_stages_have_no_activation() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let cnn = Cnn::new(&CnnConfig::new(8, 2), &[1, 8, 8], 1, Role::Basis { n_basis: 2 }, vb)
            .unwrap();

        let images = Tensor::randn(0.0f32, 1.0, (4, 1, 8, 8), &device).unwrap();
        let features = cnn.features(&images).unwrap();
        assert_eq!(features.dims(), &[4, 8]);
        // ReLU stages could never produce a negative feature
        let min = features.min_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min < 0.0, "{min}");
    }

    #[test]
    fn test_flatten_size_floors_odd_sides() {
        // 9 -> 4 -> 2 -> 1
        assert_eq!(flatten_size(&[1, 9, 17]), 8 * 2);
    }

    #[test]
    fn test_rejects_too_many_channels() {
        assert!(CnnConfig::default().validate(&[5, 32, 32]).is_err());
        assert!(CnnConfig::default().validate(&[3, 4, 32]).is_err());
        assert!(CnnConfig::default().validate(&[3, 32]).is_err());
    }
}
