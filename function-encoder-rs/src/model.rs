//! The function encoder: a learned basis plus a representation solver.
//!
//! All parameters (basis, optional average function, optional Deep Sets
//! encoder) live in one [`VarMap`] owned by the [`FunctionEncoder`], under the
//! prefixes `basis`, `average` and `encoder`.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::architecture::{Architecture, DeepSetsEncoder, Role};
use crate::config::{FunctionEncoderConfig, RepresentationMode};
use crate::dataset::{check_points, FunctionBatch};
use crate::error::{EncoderError, EncoderResult};
use crate::inner_product::DataType;
use crate::init::reinitialize;
use crate::optimizer::{EncoderOptimizer, GradientAccumulator};
use crate::oracle::{
    count_parameters, predict_number_params, ParameterBreakdown, AVERAGE_PREFIX, BASIS_PREFIX,
    ENCODER_PREFIX,
};
use crate::solver::{
    identity, inner_product_representation, least_squares_representation, Representation,
    RepresentationOptions,
};

/// Loss terms of one training step, still attached to the graph.
#[derive(Debug, Clone)]
pub struct TrainingLosses {
    /// `prediction + regularization * orthonormality + average_function`
    pub total: Tensor,
    /// Mean squared distance between predictions and query outputs
    pub prediction: Tensor,
    /// `mean((diag(gram) - 1)^2)`, least-squares mode only
    pub orthonormality: Option<Tensor>,
    /// Mean squared distance of the average function, residual method only
    pub average_function: Option<Tensor>,
}

/// Learned basis functions and the machinery to represent functions in them.
pub struct FunctionEncoder {
    pub(crate) config: FunctionEncoderConfig,
    pub(crate) device: Device,
    pub(crate) var_map: VarMap,
    basis: Box<dyn Architecture>,
    average: Option<Box<dyn Architecture>>,
    encoder: Option<DeepSetsEncoder>,
    pub(crate) optimizer: EncoderOptimizer,
    pub(crate) accumulator: GradientAccumulator,
}

impl std::fmt::Debug for FunctionEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEncoder")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("basis", &self.basis)
            .field("average", &self.average)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}

impl FunctionEncoder {
    /// Build every network described by `config` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for an invalid configuration and
    /// [`EncoderError::ConfigurationMismatch`] if the allocated parameters
    /// disagree with [`predict_number_params`].
    pub fn new(config: FunctionEncoderConfig, device: &Device) -> EncoderResult<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let (input, output) = (&config.input_size, &config.output_size);

        let basis = config.model_type.build(
            input,
            output,
            Role::Basis {
                n_basis: config.n_basis,
            },
            vb.pp(BASIS_PREFIX),
        )?;
        let average = if config.use_residuals_method {
            Some(config.model_type.build(input, output, Role::Average, vb.pp(AVERAGE_PREFIX))?)
        } else {
            None
        };
        let encoder = match &config.representation_mode {
            RepresentationMode::EncoderNetwork(encoder) => Some(DeepSetsEncoder::new(
                encoder,
                input,
                output,
                config.n_basis,
                vb.pp(ENCODER_PREFIX),
            )?),
            _ => None,
        };

        if let Some(seed) = config.seed {
            reinitialize(&var_map, seed)?;
        }

        let counts = count_parameters(&var_map)?;
        counts.check_against(&predict_number_params(&config))?;

        let optimizer = config.optimizer.build(var_map.all_vars())?;
        tracing::debug!(
            model_type = config.model_type.name(),
            mode = config.representation_mode.as_str(),
            n_basis = config.n_basis,
            n_params = counts.total(),
            "built function encoder"
        );

        Ok(Self {
            config,
            device: device.clone(),
            var_map,
            basis,
            average,
            encoder,
            optimizer,
            accumulator: GradientAccumulator::new(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &FunctionEncoderConfig {
        &self.config
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Inner product used for representations and losses.
    pub fn data_type(&self) -> DataType {
        self.config.data_type
    }

    /// Number of basis functions `K`.
    pub fn n_basis(&self) -> usize {
        self.config.n_basis
    }

    /// Get reference to the parameter store.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Scalar parameters per sub-network.
    ///
    /// # Errors
    ///
    /// Fails only if the parameter store is poisoned.
    pub fn parameter_breakdown(&self) -> EncoderResult<ParameterBreakdown> {
        count_parameters(&self.var_map)
    }

    /// Total scalar parameter count.
    pub fn num_params(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Hyper-parameters as display strings.
    pub fn hyperparameters(&self) -> BTreeMap<String, String> {
        self.config.hyperparameters()
    }

    /// Current optimizer learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Override the optimizer learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Evaluate the basis at `xs: (F, D, *input)`, giving `(F, D, M, K)`.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for a wrongly shaped input.
    pub fn forward_basis_functions(&self, xs: &Tensor) -> EncoderResult<Tensor> {
        self.check_inputs("xs", xs)?;
        Ok(self.basis.forward(xs)?)
    }

    /// Evaluate the average function at `xs: (F, D, *input)`, giving
    /// `(F, D, M)`; `None` unless the residual method is on.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for a wrongly shaped input.
    pub fn forward_average_function(&self, xs: &Tensor) -> EncoderResult<Option<Tensor>> {
        let Some(average) = &self.average else {
            return Ok(None);
        };
        self.check_inputs("xs", xs)?;
        Ok(Some(average.forward(xs)?))
    }

    /// Coefficients `(F, K)` of every function in the batch.
    ///
    /// With the residual method, the detached average function is subtracted
    /// from `example_ys` first, except in encoder-network mode which always
    /// sees the original outputs.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for shape violations, zero
    /// example points or a negative `lambda`, and [`EncoderError::Numerical`]
    /// for a singular least-squares system.
    pub fn compute_representation(
        &self,
        example_xs: &Tensor,
        example_ys: &Tensor,
        options: &RepresentationOptions,
    ) -> EncoderResult<Representation> {
        let (f, d) = self.check_inputs("example_xs", example_xs)?;
        self.check_outputs("example_ys", example_ys, f, d)?;
        if d == 0 {
            return Err(EncoderError::precondition(
                "a representation needs at least one example point",
            ));
        }

        if let RepresentationMode::EncoderNetwork(_) = self.config.representation_mode {
            let encoder = self.encoder.as_ref().ok_or_else(|| {
                EncoderError::precondition("encoder-network mode without an encoder network")
            })?;
            return Ok(Representation {
                coefficients: encoder.forward(example_xs, example_ys)?,
                gram: None,
            });
        }

        let gs = self.basis.forward(example_xs)?;
        let ys = self.residual_outputs(example_xs, example_ys)?;
        match self.config.representation_mode {
            RepresentationMode::LeastSquares => least_squares_representation(
                self.data_type(),
                &gs,
                &ys,
                options.resolved_lambda()?,
            ),
            _ => inner_product_representation(self.data_type(), &gs, &ys),
        }
    }

    /// [`compute_representation`](Self::compute_representation) for one
    /// function: `(D, *input)` and `(D, *output)` in, `(K,)` out.
    ///
    /// # Errors
    ///
    /// As for the batched version.
    pub fn compute_representation_single(
        &self,
        example_xs: &Tensor,
        example_ys: &Tensor,
        options: &RepresentationOptions,
    ) -> EncoderResult<Representation> {
        self.compute_representation(&example_xs.unsqueeze(0)?, &example_ys.unsqueeze(0)?, options)?
            .squeeze_batch()
    }

    /// `Σ_k c_k g_k(query_xs)`, plus the average function when the residual
    /// method is on. Returns `(F, Dq, M)`.
    ///
    /// `precomputed_average` replaces the average-function evaluation at
    /// `query_xs` when supplied.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for shape violations, or for a
    /// precomputed average on an encoder without one.
    pub fn predict(
        &self,
        query_xs: &Tensor,
        coefficients: &Tensor,
        precomputed_average: Option<&Tensor>,
    ) -> EncoderResult<Tensor> {
        let (f, dq) = self.check_inputs("query_xs", query_xs)?;
        let k = self.config.n_basis;
        if coefficients.dims() != [f, k] {
            return Err(EncoderError::precondition(format!(
                "coefficients must have shape [{f}, {k}], got {:?}",
                coefficients.dims()
            )));
        }

        let gs = self.basis.forward(query_xs)?;
        let y_hats = gs.broadcast_mul(&coefficients.reshape((f, 1, 1, k))?)?.sum(3)?;

        match (&self.average, precomputed_average) {
            (None, None) => Ok(y_hats),
            (None, Some(_)) => Err(EncoderError::precondition(
                "a precomputed average was given but the residual method is off",
            )),
            (Some(_), Some(average)) => {
                self.check_outputs("precomputed_average", average, f, dq)?;
                Ok((y_hats + average)?)
            }
            (Some(average), None) => Ok((y_hats + average.forward(query_xs)?)?),
        }
    }

    /// [`predict`](Self::predict) for one function: `(Dq, *input)` and `(K,)`
    /// in, `(Dq, M)` out.
    ///
    /// # Errors
    ///
    /// As for the batched version.
    pub fn predict_single(
        &self,
        query_xs: &Tensor,
        coefficients: &Tensor,
        precomputed_average: Option<&Tensor>,
    ) -> EncoderResult<Tensor> {
        let average = precomputed_average.map(|a| a.unsqueeze(0)).transpose()?;
        let y_hats = self.predict(
            &query_xs.unsqueeze(0)?,
            &coefficients.unsqueeze(0)?,
            average.as_ref(),
        )?;
        Ok(y_hats.squeeze(0)?)
    }

    /// Represent each function from its examples, then predict at `query_xs`.
    ///
    /// # Errors
    ///
    /// Any error of [`compute_representation`](Self::compute_representation)
    /// or [`predict`](Self::predict).
    pub fn predict_from_examples(
        &self,
        example_xs: &Tensor,
        example_ys: &Tensor,
        query_xs: &Tensor,
        options: &RepresentationOptions,
    ) -> EncoderResult<Tensor> {
        let representation = self.compute_representation(example_xs, example_ys, options)?;
        self.predict(query_xs, &representation.coefficients, None)
    }

    /// [`predict_from_examples`](Self::predict_from_examples) for one function.
    ///
    /// # Errors
    ///
    /// As for the batched version.
    pub fn predict_from_examples_single(
        &self,
        example_xs: &Tensor,
        example_ys: &Tensor,
        query_xs: &Tensor,
        options: &RepresentationOptions,
    ) -> EncoderResult<Tensor> {
        let representation = self.compute_representation_single(example_xs, example_ys, options)?;
        self.predict_single(query_xs, &representation.coefficients, None)
    }

    /// Distance `(F,)` from each example function to its projection onto the
    /// span of the basis: `sqrt(max(‖y‖² - cᵀ G c, 0))`.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] outside least-squares mode.
    pub fn estimate_l2_error(
        &self,
        example_xs: &Tensor,
        example_ys: &Tensor,
        options: &RepresentationOptions,
    ) -> EncoderResult<Tensor> {
        if self.config.representation_mode != RepresentationMode::LeastSquares {
            return Err(EncoderError::precondition(format!(
                "L2 error estimates need least-squares mode, encoder is in {} mode",
                self.config.representation_mode.as_str()
            )));
        }
        let (f, d) = self.check_inputs("example_xs", example_xs)?;
        self.check_outputs("example_ys", example_ys, f, d)?;

        let gs = self.basis.forward(example_xs)?;
        let ys = self.residual_outputs(example_xs, example_ys)?;
        let representation =
            least_squares_representation(self.data_type(), &gs, &ys, options.resolved_lambda()?)?;
        let gram = representation
            .gram
            .ok_or_else(|| EncoderError::numerical("least squares returned no Gram matrix"))?;
        let c = representation.coefficients;

        let energy = self.data_type().norm(&ys, true)?;
        let projected = c.unsqueeze(1)?.matmul(&gram)?.matmul(&c.unsqueeze(2)?)?.reshape(f)?;
        Ok((energy - projected)?.relu()?.sqrt()?)
    }

    /// Every loss term of a training step on `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for a batch that does not match
    /// the configured sizes, plus any representation error.
    pub fn training_losses(
        &self,
        batch: &FunctionBatch,
        options: &RepresentationOptions,
    ) -> EncoderResult<TrainingLosses> {
        batch.validate(&self.config.input_size, &self.config.output_size)?;
        let data_type = self.data_type();

        let (average_function, average) = match &self.average {
            Some(average) => {
                let prediction = average.forward(&batch.query_xs)?;
                let loss = data_type
                    .distance(&prediction, &batch.query_ys, true)?
                    .mean_all()?;
                (Some(loss), Some(prediction.detach()))
            }
            None => (None, None),
        };

        let representation =
            self.compute_representation(&batch.example_xs, &batch.example_ys, options)?;
        let y_hats = self.predict(&batch.query_xs, &representation.coefficients, average.as_ref())?;
        let prediction = data_type.distance(&y_hats, &batch.query_ys, true)?.mean_all()?;

        let orthonormality = match (&self.config.representation_mode, &representation.gram) {
            (RepresentationMode::LeastSquares, Some(gram)) => Some(orthonormality_penalty(gram)?),
            _ => None,
        };

        let mut total = prediction.clone();
        if let Some(penalty) = &orthonormality {
            total = (total + (penalty * self.config.regularization_parameter)?)?;
        }
        if let Some(loss) = &average_function {
            total = (total + loss)?;
        }

        Ok(TrainingLosses {
            total,
            prediction,
            orthonormality,
            average_function,
        })
    }

    /// Outputs with the detached average function subtracted, when there is one.
    fn residual_outputs(&self, xs: &Tensor, ys: &Tensor) -> EncoderResult<Tensor> {
        match &self.average {
            Some(average) => Ok((ys - average.forward(xs)?.detach())?),
            None => Ok(ys.clone()),
        }
    }

    fn check_inputs(&self, name: &str, xs: &Tensor) -> EncoderResult<(usize, usize)> {
        let f = xs.dims().first().copied().unwrap_or(0);
        let d = check_points(name, xs, f, None, &self.config.input_size)?;
        Ok((f, d))
    }

    fn check_outputs(&self, name: &str, ys: &Tensor, f: usize, d: usize) -> EncoderResult<()> {
        check_points(name, ys, f, Some(d), &self.config.output_size)?;
        Ok(())
    }
}

/// `mean((diag(gram) - 1)^2)` over every function and basis index.
fn orthonormality_penalty(gram: &Tensor) -> EncoderResult<Tensor> {
    let k = gram.dim(1)?;
    let eye = identity(k, gram.dtype(), gram.device())?;
    let diagonal = gram.broadcast_mul(&eye)?.sum(2)?;
    Ok((diagonal - 1.0)?.sqr()?.mean_all()?)
}
