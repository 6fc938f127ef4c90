//! Configuration for function encoders.
//!
//! [`FunctionEncoderConfig`] fully determines the networks an encoder builds,
//! so it is also what a checkpoint stores next to the weights.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::architecture::{DeepSetsConfig, ModelType};
use crate::error::{EncoderError, EncoderResult};
use crate::inner_product::DataType;
use crate::optimizer::OptimizerConfig;
use crate::solver::RepresentationOptions;

/// How coefficients are computed from example data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RepresentationMode {
    /// One Monte-Carlo inner product per basis function.
    InnerProduct,
    /// Ridge-regularized least squares against the Gram matrix.
    #[default]
    LeastSquares,
    /// A learned Deep Sets encoder.
    EncoderNetwork(DeepSetsConfig),
}

impl RepresentationMode {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InnerProduct => "inner_product",
            Self::LeastSquares => "least_squares",
            Self::EncoderNetwork(_) => "encoder_network",
        }
    }
}

fn default_n_basis() -> usize {
    100
}

fn default_regularization() -> f64 {
    1.0
}

fn default_accumulation() -> usize {
    1
}

fn default_max_grad_norm() -> f64 {
    1.0
}

/// Configuration of a [`FunctionEncoder`](crate::FunctionEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEncoderConfig {
    /// Shape of one input point: `[n]` or `[C, H, W]`
    pub input_size: Vec<usize>,
    /// Shape of one output point: `[m]`
    pub output_size: Vec<usize>,
    /// Which inner product defines the Hilbert space
    pub data_type: DataType,
    /// Number of basis functions `K`
    #[serde(default = "default_n_basis")]
    pub n_basis: usize,
    /// Basis (and average) network architecture
    #[serde(default)]
    pub model_type: ModelType,
    /// Coefficient solver
    #[serde(default)]
    pub representation_mode: RepresentationMode,
    /// Fit a learned average function and the basis to the residual
    #[serde(default)]
    pub use_residuals_method: bool,
    /// Weight of the Gram-diagonal penalty in least-squares training
    #[serde(default = "default_regularization")]
    pub regularization_parameter: f64,
    /// Backward passes per optimizer step
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation: usize,
    /// Global gradient norm clip
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    /// Optimizer hyper-parameters
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Seed for parameter initialization; `None` keeps candle's default init
    #[serde(default)]
    pub seed: Option<u64>,
}

impl FunctionEncoderConfig {
    /// Default encoder for the given shapes and data type.
    #[must_use]
    pub fn new(input_size: Vec<usize>, output_size: Vec<usize>, data_type: DataType) -> Self {
        Self {
            input_size,
            output_size,
            data_type,
            n_basis: default_n_basis(),
            model_type: ModelType::default(),
            representation_mode: RepresentationMode::default(),
            use_residuals_method: false,
            regularization_parameter: default_regularization(),
            gradient_accumulation: default_accumulation(),
            max_grad_norm: default_max_grad_norm(),
            optimizer: OptimizerConfig::default(),
            seed: None,
        }
    }

    /// Set the number of basis functions.
    #[must_use]
    pub fn with_n_basis(mut self, n_basis: usize) -> Self {
        self.n_basis = n_basis;
        self
    }

    /// Set the basis architecture.
    #[must_use]
    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Set the representation mode.
    #[must_use]
    pub fn with_representation_mode(mut self, mode: RepresentationMode) -> Self {
        self.representation_mode = mode;
        self
    }

    /// Enable or disable the residuals method.
    #[must_use]
    pub fn with_residuals(mut self, enabled: bool) -> Self {
        self.use_residuals_method = enabled;
        self
    }

    /// Set the orthonormality penalty weight.
    #[must_use]
    pub fn with_regularization_parameter(mut self, weight: f64) -> Self {
        self.regularization_parameter = weight;
        self
    }

    /// Set the number of batches per optimizer step.
    #[must_use]
    pub fn with_gradient_accumulation(mut self, steps: usize) -> Self {
        self.gradient_accumulation = steps;
        self
    }

    /// Set the optimizer.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Seed parameter initialization.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Output dimension `M`.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.output_size.iter().product()
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] naming the first invalid field.
    pub fn validate(&self) -> EncoderResult<()> {
        if !matches!(self.input_size.len(), 1 | 3) || self.input_size.contains(&0) {
            return Err(EncoderError::precondition(format!(
                "input size must be [n] or [C, H, W] with positive entries, got {:?}",
                self.input_size
            )));
        }
        if self.output_size.len() != 1 || self.output_size[0] == 0 {
            return Err(EncoderError::precondition(format!(
                "output size must be [m] with m >= 1, got {:?}",
                self.output_size
            )));
        }
        if self.data_type == DataType::Stochastic && self.output_size[0] != 1 {
            return Err(EncoderError::precondition(format!(
                "stochastic data requires an output size of [1], got {:?}",
                self.output_size
            )));
        }
        if self.n_basis == 0 {
            return Err(EncoderError::precondition("n_basis must be at least 1"));
        }
        if !self.regularization_parameter.is_finite() || self.regularization_parameter < 0.0 {
            return Err(EncoderError::precondition(format!(
                "regularization parameter must be finite and >= 0, got {}",
                self.regularization_parameter
            )));
        }
        if self.gradient_accumulation == 0 {
            return Err(EncoderError::precondition("gradient accumulation must be at least 1"));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(EncoderError::precondition(format!(
                "max gradient norm must be positive, got {}",
                self.max_grad_norm
            )));
        }
        self.model_type.validate(&self.input_size)?;
        if let RepresentationMode::EncoderNetwork(encoder) = &self.representation_mode {
            encoder.validate()?;
        }
        self.optimizer.validate()
    }

    /// Hyper-parameters as display strings, for experiment logs.
    #[must_use]
    pub fn hyperparameters(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("input_size".into(), format!("{:?}", self.input_size));
        params.insert("output_size".into(), format!("{:?}", self.output_size));
        params.insert("data_type".into(), self.data_type.to_string());
        params.insert("n_basis".into(), self.n_basis.to_string());
        params.insert("representation_mode".into(), self.representation_mode.as_str().into());
        params.insert("model_type".into(), self.model_type.name().into());
        params.insert("use_residuals_method".into(), self.use_residuals_method.to_string());
        if self.representation_mode == RepresentationMode::LeastSquares {
            params.insert(
                "regularization_parameter".into(),
                self.regularization_parameter.to_string(),
            );
        }
        params.insert("learning_rate".into(), self.optimizer.learning_rate.to_string());
        if let Ok(serde_json::Value::Object(model)) = serde_json::to_value(&self.model_type) {
            for (key, value) in model {
                if key != "type" {
                    params.insert(key, value.to_string());
                }
            }
        }
        if let RepresentationMode::EncoderNetwork(encoder) = &self.representation_mode {
            if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(encoder) {
                for (key, value) in fields {
                    params.insert(format!("encoder_{key}"), value.to_string());
                }
            }
        }
        params
    }
}

/// Options for [`FunctionEncoder::train_model`](crate::FunctionEncoder::train_model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOptions {
    /// Number of sampled batches (one optimizer micro-step each)
    pub epochs: usize,
    /// Draw a terminal progress bar
    #[serde(default)]
    pub progress_bar: bool,
    /// Options forwarded to every representation solve
    #[serde(default)]
    pub representation: RepresentationOptions,
}

impl TrainingOptions {
    /// Train for `epochs` batches without a progress bar.
    #[must_use]
    pub fn new(epochs: usize) -> Self {
        Self {
            epochs,
            progress_bar: false,
            representation: RepresentationOptions::default(),
        }
    }

    /// Show or hide the progress bar.
    #[must_use]
    pub fn with_progress_bar(mut self, progress_bar: bool) -> Self {
        self.progress_bar = progress_bar;
        self
    }

    /// Override the least-squares ridge term used during training.
    #[must_use]
    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.representation = RepresentationOptions::with_lambda(lambda);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{Aggregation, CnnConfig, MlpConfig};

    fn base() -> FunctionEncoderConfig {
        FunctionEncoderConfig::new(vec![1], vec![1], DataType::Deterministic)
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.n_basis, 100);
        assert_eq!(config.representation_mode, RepresentationMode::LeastSquares);
        assert_eq!(config.model_type, ModelType::Mlp(MlpConfig::new(256, 4)));
        assert!((config.regularization_parameter - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.gradient_accumulation, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{"input_size":[2],"output_size":[1],"data_type":"deterministic"}"#;
        let config: FunctionEncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, FunctionEncoderConfig::new(vec![2], vec![1], DataType::Deterministic));

        let encoder = base().with_representation_mode(RepresentationMode::EncoderNetwork(
            DeepSetsConfig::default().with_aggregation(Aggregation::Attention),
        ));
        let text = serde_json::to_string(&encoder).unwrap();
        let back: FunctionEncoderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, encoder);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut config = base();
        config.input_size = vec![2, 2];
        assert!(config.validate().is_err());

        let mut config = base();
        config.output_size = vec![0];
        assert!(config.validate().is_err());

        let config = FunctionEncoderConfig::new(vec![1], vec![2], DataType::Stochastic);
        assert!(config.validate().is_err());

        let config = base().with_model_type(ModelType::Cnn(CnnConfig::default()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_training_settings() {
        assert!(base().with_gradient_accumulation(0).validate().is_err());
        assert!(base().with_regularization_parameter(-1.0).validate().is_err());
        assert!(base().with_n_basis(0).validate().is_err());
    }

    #[test]
    fn test_hyperparameters_include_model_and_encoder_fields() {
        let params = base()
            .with_representation_mode(RepresentationMode::EncoderNetwork(DeepSetsConfig::default()))
            .hyperparameters();
        assert_eq!(params["model_type"], "MLP");
        assert_eq!(params["hidden_size"], "256");
        assert_eq!(params["encoder_aggregation"], "\"mean\"");
        assert!(!params.contains_key("regularization_parameter"));

        let params = base().hyperparameters();
        assert_eq!(params["regularization_parameter"], "1");
    }
}
