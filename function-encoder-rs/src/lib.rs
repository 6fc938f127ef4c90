//! Function encoders in pure Rust on candle.
//!
//! A function encoder learns `K` basis functions `g_1..g_K` so that any
//! function of a family can be written as `f ≈ Σ_k c_k g_k`. Given a handful of
//! example input/output pairs, the coefficients are computed by one of three
//! interchangeable solvers:
//! - Monte-Carlo inner products `c_k = ⟨f, g_k⟩`
//! - Ridge-regularized least squares against the basis Gram matrix
//! - A learned Deep Sets encoder mapping the examples straight to `c`
//!
//! Inner products come in three flavours ([`DataType`]): plain L2 for
//! deterministic functions, centred over datapoints for stochastic ones, and
//! centred over categories for categorical outputs. An optional learned
//! average function can be subtracted before fitting the basis (the residual
//! method).
//!
//! # Example
//!
//! ```no_run
//! use function_encoder_rs::{DataType, FunctionEncoder, FunctionEncoderConfig, RepresentationOptions};
//! use candle_core::{Device, Tensor};
//!
//! let config = FunctionEncoderConfig::new(vec![1], vec![1], DataType::Deterministic).with_n_basis(8);
//! let device = Device::Cpu;
//! let encoder = FunctionEncoder::new(config, &device).unwrap();
//!
//! let xs = Tensor::randn(0f32, 1.0, (4, 50, 1), &device).unwrap();
//! let ys = xs.sqr().unwrap();
//! let y_hats = encoder
//!     .predict_from_examples(&xs, &ys, &xs, &RepresentationOptions::default())
//!     .unwrap();
//! assert_eq!(y_hats.dims(), &[4, 50, 1]);
//! ```
//!
//! # Training
//!
//! Implement [`Dataset`] for a source of function batches and call
//! [`FunctionEncoder::train_model`]:
//!
//! ```no_run
//! # use function_encoder_rs::prelude::*;
//! # fn run(encoder: &mut FunctionEncoder, dataset: &mut dyn Dataset) -> EncoderResult<()> {
//! let losses = encoder.train_model(dataset, &TrainingOptions::new(1000).with_progress_bar(true), None)?;
//! encoder.save(std::path::Path::new("checkpoints/run"))?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod architecture;
pub mod callback;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod init;
pub mod inner_product;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod oracle;
pub mod solver;
pub mod trainer;

pub use architecture::{
    Activation, Aggregation, Architecture, CnnConfig, DeepSetsConfig, DeepSetsEncoder, MlpConfig,
    ModelType, ParallelMlpConfig, Role,
};
pub use callback::{
    CallbackList, DistanceCallback, OrthonormalityCallback, StepLosses, TrainingCallback,
    TrainingState,
};
pub use config::{FunctionEncoderConfig, RepresentationMode, TrainingOptions};
pub use dataset::{Dataset, FunctionBatch};
pub use error::{EncoderError, EncoderResult};
pub use inner_product::DataType;
pub use model::{FunctionEncoder, TrainingLosses};
pub use optimizer::{OptimizerConfig, OptimizerKind};
pub use oracle::{predict_number_params, ParameterBreakdown};
pub use solver::{Representation, RepresentationOptions, DEFAULT_LAMBDA};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::architecture::{Aggregation, DeepSetsConfig, MlpConfig, ModelType};
    pub use crate::callback::{CallbackList, TrainingCallback, TrainingState};
    pub use crate::config::{FunctionEncoderConfig, RepresentationMode, TrainingOptions};
    pub use crate::dataset::{Dataset, FunctionBatch};
    pub use crate::error::{EncoderError, EncoderResult};
    pub use crate::inner_product::DataType;
    pub use crate::model::FunctionEncoder;
    pub use crate::solver::RepresentationOptions;
}
