//! Representation and prediction through the public encoder API.

mod common;

use candle_core::{DType, Device, Tensor};
use common::{grid, max_abs_diff};
use function_encoder_rs::prelude::*;
use function_encoder_rs::{oracle::AVERAGE_PREFIX, ParallelMlpConfig};

fn encoder(mode: RepresentationMode, residual: bool) -> FunctionEncoder {
    let config = FunctionEncoderConfig::new(vec![1], vec![1], DataType::Deterministic)
        .with_n_basis(3)
        .with_model_type(ModelType::Mlp(MlpConfig::new(16, 3)))
        .with_representation_mode(mode)
        .with_residuals(residual)
        .with_seed(42);
    FunctionEncoder::new(config, &Device::Cpu).unwrap()
}

#[test]
fn test_least_squares_reconstructs_target_in_span() {
    let encoder = encoder(RepresentationMode::LeastSquares, false);
    let xs = grid(2, 64);
    let gs = encoder.forward_basis_functions(&xs).unwrap();

    let truth = Tensor::new(&[[0.5f32, -1.0, 2.0], [1.5, 0.25, -0.75]], &Device::Cpu).unwrap();
    let ys = encoder.predict(&xs, &truth, None).unwrap();
    assert_eq!(gs.dims(), &[2, 64, 1, 3]);

    let options = RepresentationOptions::with_lambda(0.0);
    let representation = encoder.compute_representation(&xs, &ys, &options).unwrap();
    let y_hats = encoder.predict(&xs, &representation.coefficients, None).unwrap();

    let scale = max_abs_diff(&ys, &ys.zeros_like().unwrap());
    assert!(max_abs_diff(&y_hats, &ys) < 1e-2 * scale.max(1.0));
}

#[test]
fn test_single_entry_points_match_batched() {
    let options = RepresentationOptions::default();
    for mode in [
        RepresentationMode::InnerProduct,
        RepresentationMode::LeastSquares,
        RepresentationMode::EncoderNetwork(DeepSetsConfig::default().with_layers(8, 2)),
    ] {
        let encoder = encoder(mode, true);
        let xs = grid(1, 30);
        let ys = xs.sqr().unwrap();
        let queries = grid(1, 11);

        let batched = encoder.compute_representation(&xs, &ys, &options).unwrap();
        let single = encoder
            .compute_representation_single(
                &xs.squeeze(0).unwrap(),
                &ys.squeeze(0).unwrap(),
                &options,
            )
            .unwrap();
        assert_eq!(single.coefficients.dims(), &[3]);
        let batched = batched.coefficients.squeeze(0).unwrap();
        assert!(max_abs_diff(&single.coefficients, &batched) < 1e-6);

        let batched_y = encoder.predict_from_examples(&xs, &ys, &queries, &options).unwrap();
        let single_y = encoder
            .predict_from_examples_single(
                &xs.squeeze(0).unwrap(),
                &ys.squeeze(0).unwrap(),
                &queries.squeeze(0).unwrap(),
                &options,
            )
            .unwrap();
        assert_eq!(single_y.dims(), &[11, 1]);
        assert!(max_abs_diff(&single_y, &batched_y.squeeze(0).unwrap()) < 1e-6);
    }
}

#[test]
fn test_precomputed_average_matches_evaluated_average() {
    let encoder = encoder(RepresentationMode::InnerProduct, true);
    let xs = grid(2, 20);
    let coefficients = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
    let average = encoder.forward_average_function(&xs).unwrap().unwrap();
    assert_eq!(average.dims(), &[2, 20, 1]);

    let direct = encoder.predict(&xs, &coefficients, None).unwrap();
    let precomputed = encoder.predict(&xs, &coefficients, Some(&average)).unwrap();
    assert!(max_abs_diff(&direct, &precomputed) < 1e-6);
}

#[test]
fn test_prediction_loss_does_not_reach_average_function() {
    let encoder = encoder(RepresentationMode::LeastSquares, true);
    let batch = common::Quadratics::new(5).sample().unwrap();
    let losses = encoder.training_losses(&batch, &RepresentationOptions::default()).unwrap();

    let data = encoder.var_map().data().lock().unwrap();
    let average_vars: Vec<_> = data
        .iter()
        .filter(|(name, _)| name.starts_with(AVERAGE_PREFIX))
        .map(|(_, var)| var.clone())
        .collect();
    assert!(!average_vars.is_empty());

    let grads = losses.prediction.backward().unwrap();
    for var in &average_vars {
        let reached = grads
            .get(var.as_tensor())
            .map(|g| g.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .unwrap_or(0.0);
        assert_eq!(reached, 0.0);
    }

    let grads = losses.average_function.unwrap().backward().unwrap();
    assert!(average_vars.iter().any(|var| grads.get(var.as_tensor()).is_some()));
}

#[test]
fn test_l2_error_small_for_targets_in_span() {
    let encoder = encoder(RepresentationMode::LeastSquares, false);
    let xs = grid(1, 64);
    let truth = Tensor::new(&[[1.0f32, -0.5, 0.25]], &Device::Cpu).unwrap();
    let in_span = encoder.predict(&xs, &truth, None).unwrap();
    let options = RepresentationOptions::with_lambda(0.0);

    let error = encoder.estimate_l2_error(&xs, &in_span, &options).unwrap();
    let energy = DataType::Deterministic.norm(&in_span, false).unwrap();
    let ratio = (error / energy).unwrap().squeeze(0).unwrap().to_scalar::<f32>().unwrap();
    assert!(ratio < 0.05, "relative error {ratio}");
}

#[test]
fn test_stochastic_and_categorical_encoders() {
    let stochastic = FunctionEncoderConfig::new(vec![2], vec![1], DataType::Stochastic)
        .with_n_basis(4)
        .with_model_type(ModelType::ParallelMlp(ParallelMlpConfig::new(8, 2)))
        .with_representation_mode(RepresentationMode::InnerProduct);
    let encoder = FunctionEncoder::new(stochastic, &Device::Cpu).unwrap();
    let xs = Tensor::randn(0f32, 1.0, (3, 25, 2), &Device::Cpu).unwrap();
    let ys = Tensor::randn(0f32, 1.0, (3, 25, 1), &Device::Cpu).unwrap();
    let y_hats = encoder
        .predict_from_examples(&xs, &ys, &xs, &RepresentationOptions::default())
        .unwrap();
    assert_eq!(y_hats.dims(), &[3, 25, 1]);

    let categorical = FunctionEncoderConfig::new(vec![2], vec![4], DataType::Categorical)
        .with_n_basis(5)
        .with_model_type(ModelType::Mlp(MlpConfig::new(8, 2)));
    let encoder = FunctionEncoder::new(categorical, &Device::Cpu).unwrap();
    let ys = Tensor::randn(0f32, 1.0, (3, 25, 4), &Device::Cpu).unwrap();
    let representation = encoder
        .compute_representation(&xs, &ys, &RepresentationOptions::default())
        .unwrap();
    assert_eq!(representation.coefficients.dims(), &[3, 5]);
}

#[test]
fn test_negative_lambda_rejected() {
    let encoder = encoder(RepresentationMode::LeastSquares, false);
    let xs = grid(1, 10);
    let options = RepresentationOptions::with_lambda(-1.0);
    let result = encoder.compute_representation(&xs, &xs, &options);
    assert!(matches!(result, Err(EncoderError::Precondition(_))));
}
