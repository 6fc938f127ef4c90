//! Save and reload encoders through checkpoint directories.

mod common;

use candle_core::Device;
use common::{grid, max_abs_diff, Quadratics};
use function_encoder_rs::prelude::*;

fn config(seed: u64) -> FunctionEncoderConfig {
    FunctionEncoderConfig::new(vec![1], vec![1], DataType::Deterministic)
        .with_n_basis(4)
        .with_model_type(ModelType::Mlp(MlpConfig::new(16, 3).with_layer_norm(true)))
        .with_residuals(true)
        .with_seed(seed)
}

fn predictions(encoder: &FunctionEncoder) -> candle_core::Tensor {
    let xs = grid(2, 25);
    let ys = xs.sqr().unwrap();
    encoder
        .predict_from_examples(&xs, &ys, &xs, &RepresentationOptions::default())
        .unwrap()
}

#[test]
fn test_round_trip_preserves_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let mut encoder = FunctionEncoder::new(config(1), &Device::Cpu).unwrap();
    encoder
        .train_model(&mut Quadratics::new(0), &TrainingOptions::new(5), None)
        .unwrap();
    encoder.save(dir.path()).unwrap();

    let reloaded = FunctionEncoder::load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(reloaded.config(), encoder.config());
    assert!(max_abs_diff(&predictions(&encoder), &predictions(&reloaded)) < 1e-6);
}

#[test]
fn test_load_weights_overwrites_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let source = FunctionEncoder::new(config(1), &Device::Cpu).unwrap();
    source.save(dir.path()).unwrap();

    // same networks, different seed and a few optimizer steps
    let mut target = FunctionEncoder::new(config(9), &Device::Cpu).unwrap();
    target
        .train_model(&mut Quadratics::new(3), &TrainingOptions::new(3), None)
        .unwrap();
    assert!(max_abs_diff(&predictions(&source), &predictions(&target)) > 0.0);

    target.load_weights(dir.path()).unwrap();
    assert!(max_abs_diff(&predictions(&source), &predictions(&target)) < 1e-6);
}

#[test]
fn test_load_weights_rejects_different_configuration() {
    let dir = tempfile::tempdir().unwrap();
    FunctionEncoder::new(config(1), &Device::Cpu)
        .unwrap()
        .save(dir.path())
        .unwrap();

    let mut other = FunctionEncoder::new(config(1).with_residuals(false), &Device::Cpu).unwrap();
    assert!(matches!(
        other.load_weights(dir.path()),
        Err(EncoderError::Checkpoint(_))
    ));
}

#[test]
fn test_saved_config_is_readable_json() {
    let dir = tempfile::tempdir().unwrap();
    FunctionEncoder::new(config(1), &Device::Cpu)
        .unwrap()
        .save(dir.path())
        .unwrap();
    let text = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    let parsed: FunctionEncoderConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, config(1));
    assert!(text.contains("\"least_squares\""));
}
