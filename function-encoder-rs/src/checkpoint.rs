//! Saving and restoring encoders.
//!
//! A checkpoint is a directory holding `config.json` (the serialized
//! [`FunctionEncoderConfig`]) and `model.safetensors` (every variable, keyed by
//! its `VarMap` name). Reloading checks the configuration and every tensor
//! name and shape before any value is overwritten.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use candle_core::Device;

use crate::config::FunctionEncoderConfig;
use crate::error::{EncoderError, EncoderResult};
use crate::init::named_vars;
use crate::model::FunctionEncoder;

/// Configuration file inside a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";
/// Weights file inside a checkpoint directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";

impl FunctionEncoder {
    /// Write `config.json` and `model.safetensors` into `dir`, creating it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns IO and serialization failures.
    ///
    /// # Example
    /// ```no_run
    /// # use function_encoder_rs::{DataType, FunctionEncoder, FunctionEncoderConfig};
    /// # use candle_core::Device;
    /// let config = FunctionEncoderConfig::new(vec![1], vec![1], DataType::Deterministic);
    /// let encoder = FunctionEncoder::new(config, &Device::Cpu).unwrap();
    /// encoder.save(std::path::Path::new("checkpoints/quadratics")).unwrap();
    /// ```
    pub fn save(&self, dir: &Path) -> EncoderResult<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&self.config)?)?;
        self.var_map.save(dir.join(WEIGHTS_FILE))?;
        tracing::info!(path = %dir.display(), n_params = self.num_params(), "saved checkpoint");
        Ok(())
    }

    /// Rebuild an encoder from a checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Checkpoint`] when the weights do not fit the
    /// stored configuration, plus IO and parse failures.
    pub fn load(dir: &Path, device: &Device) -> EncoderResult<Self> {
        let config = read_config(dir)?;
        let mut encoder = Self::new(config, device)?;
        encoder.load_weights(dir)?;
        Ok(encoder)
    }

    /// Overwrite this encoder's parameters with those of a checkpoint.
    ///
    /// The stored configuration must describe the same networks as this
    /// encoder's (training settings such as the optimizer or seed may differ),
    /// and the weights file must hold exactly the same tensor names and
    /// shapes. Optimizer moments are not part of a checkpoint and are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Checkpoint`] describing the first mismatch.
    pub fn load_weights(&mut self, dir: &Path) -> EncoderResult<()> {
        let stored = read_config(dir)?;
        if !same_networks(&stored, &self.config) {
            tracing::warn!(path = %dir.display(), "checkpoint configuration differs from encoder");
            return Err(EncoderError::checkpoint(format!(
                "configuration in {} does not match this encoder",
                dir.join(CONFIG_FILE).display()
            )));
        }

        let tensors = candle_core::safetensors::load(dir.join(WEIGHTS_FILE), &self.device)?;
        let vars = named_vars(&self.var_map)?;

        let expected: BTreeSet<&str> = vars.iter().map(|(name, _)| name.as_str()).collect();
        let found: BTreeSet<&str> = tensors.keys().map(String::as_str).collect();
        if let Some(missing) = expected.difference(&found).next() {
            return Err(EncoderError::checkpoint(format!("missing tensor `{missing}`")));
        }
        if let Some(extra) = found.difference(&expected).next() {
            return Err(EncoderError::checkpoint(format!("unexpected tensor `{extra}`")));
        }
        for (name, var) in &vars {
            let tensor = &tensors[name];
            if tensor.dims() != var.dims() {
                return Err(EncoderError::checkpoint(format!(
                    "tensor `{name}` has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
        }

        for (name, var) in &vars {
            var.set(&tensors[name].to_dtype(var.dtype())?)?;
        }
        self.accumulator.reset();
        tracing::info!(path = %dir.display(), n_tensors = vars.len(), "loaded checkpoint");
        Ok(())
    }
}

/// True when both configurations build identically shaped networks.
fn same_networks(a: &FunctionEncoderConfig, b: &FunctionEncoderConfig) -> bool {
    a.input_size == b.input_size
        && a.output_size == b.output_size
        && a.data_type == b.data_type
        && a.n_basis == b.n_basis
        && a.model_type == b.model_type
        && a.representation_mode == b.representation_mode
        && a.use_residuals_method == b.use_residuals_method
}

fn read_config(dir: &Path) -> EncoderResult<FunctionEncoderConfig> {
    let path = dir.join(CONFIG_FILE);
    let text = fs::read_to_string(&path)
        .map_err(|e| EncoderError::checkpoint(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&text)?)
}
