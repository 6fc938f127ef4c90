//! Closed-form parameter counts.
//!
//! Every encoder is checked against these counts when it is built, so a
//! network that silently allocates the wrong layer widths is caught before
//! training starts.

use candle_nn::VarMap;

use crate::architecture::Role;
use crate::config::{FunctionEncoderConfig, RepresentationMode};
use crate::error::{EncoderError, EncoderResult};
use crate::init::named_vars;

/// Variable-name prefix of the basis network.
pub const BASIS_PREFIX: &str = "basis";
/// Variable-name prefix of the average function.
pub const AVERAGE_PREFIX: &str = "average";
/// Variable-name prefix of the representation encoder.
pub const ENCODER_PREFIX: &str = "encoder";

/// Scalar parameter counts per sub-network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterBreakdown {
    /// Basis network
    pub basis: usize,
    /// Average function, zero unless the residual method is on
    pub average: usize,
    /// Deep Sets encoder, zero outside encoder-network mode
    pub encoder: usize,
}

impl ParameterBreakdown {
    /// Sum over all sub-networks.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.basis + self.average + self.encoder
    }

    /// Compare against `expected`, naming the first sub-network that differs.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::ConfigurationMismatch`] on any difference.
    pub fn check_against(&self, expected: &Self) -> EncoderResult<()> {
        for (component, actual, want) in [
            (BASIS_PREFIX, self.basis, expected.basis),
            (AVERAGE_PREFIX, self.average, expected.average),
            (ENCODER_PREFIX, self.encoder, expected.encoder),
        ] {
            if actual != want {
                return Err(EncoderError::configuration_mismatch(component, actual, want));
            }
        }
        Ok(())
    }
}

/// Parameters an encoder built from `config` will have.
#[must_use]
pub fn predict_number_params(config: &FunctionEncoderConfig) -> ParameterBreakdown {
    let input = &config.input_size;
    let output = &config.output_size;
    let basis = config
        .model_type
        .predict_number_params(input, output, Role::Basis { n_basis: config.n_basis });
    let average = if config.use_residuals_method {
        config.model_type.predict_number_params(input, output, Role::Average)
    } else {
        0
    };
    let encoder = match &config.representation_mode {
        RepresentationMode::EncoderNetwork(encoder) => {
            encoder.predict_number_params(input, output, config.n_basis)
        }
        _ => 0,
    };
    ParameterBreakdown {
        basis,
        average,
        encoder,
    }
}

/// Count the scalars stored in `var_map`, grouped by sub-network prefix.
///
/// # Errors
///
/// Returns [`EncoderError::ConfigurationMismatch`] for a variable outside the
/// known prefixes.
pub fn count_parameters(var_map: &VarMap) -> EncoderResult<ParameterBreakdown> {
    let mut counts = ParameterBreakdown::default();
    for (name, var) in named_vars(var_map)? {
        let n = var.elem_count();
        match name.split('.').next() {
            Some(BASIS_PREFIX) => counts.basis += n,
            Some(AVERAGE_PREFIX) => counts.average += n,
            Some(ENCODER_PREFIX) => counts.encoder += n,
            _ => return Err(EncoderError::configuration_mismatch(name, n, 0)),
        }
    }
    Ok(counts)
}
