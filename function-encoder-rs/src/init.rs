//! Seeded parameter initialization.
//!
//! candle draws its default initial values from a global generator, so two
//! encoders built from the same configuration differ. With a seed, every
//! variable is redrawn from a ChaCha8 stream in sorted-name order instead.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{EncoderError, EncoderResult};

/// All variables of `var_map`, sorted by name.
pub(crate) fn named_vars(var_map: &VarMap) -> EncoderResult<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|e| EncoderError::checkpoint(format!("parameter store lock poisoned: {e}")))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Redraw every variable of `var_map` from a generator seeded with `seed`.
///
/// Weights of rank 2 and above are uniform in `±1/sqrt(fan_in)`, where
/// `fan_in` is the input width (times the kernel area for convolutions).
/// Biases use the bound of their sibling weight. Rank-1 weights belong to
/// layer norms and are reset to one, with their biases reset to zero.
/// Anything else, such as Euclidean basis vectors, is uniform in `±1`.
///
/// # Errors
///
/// Propagates tensor failures.
pub fn reinitialize(var_map: &VarMap, seed: u64) -> EncoderResult<()> {
    let vars = named_vars(var_map)?;
    let shapes: HashMap<&str, &[usize]> =
        vars.iter().map(|(k, v)| (k.as_str(), v.dims())).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    for (name, var) in &vars {
        let init = match name.strip_suffix("bias") {
            Some(prefix) => match shapes.get(format!("{prefix}weight").as_str()) {
                Some(dims) if dims.len() == 1 => Fill::Const(0.0),
                Some(dims) => Fill::Uniform(fan_in_bound(dims)),
                None => Fill::Uniform(1.0),
            },
            None if name.ends_with("weight") => match var.dims() {
                [_] => Fill::Const(1.0),
                dims => Fill::Uniform(fan_in_bound(dims)),
            },
            None => Fill::Uniform(1.0),
        };
        fill(var, init, &mut rng)?;
    }
    tracing::debug!(seed, n_vars = vars.len(), "reinitialized parameters");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Fill {
    Const(f32),
    Uniform(f32),
}

fn fan_in_bound(dims: &[usize]) -> f32 {
    let fan_in = match dims {
        // (out, in, kh, kw)
        [_, rest @ ..] if dims.len() == 4 => rest.iter().product(),
        [.., last] => *last,
        [] => 1,
    };
    1.0 / (fan_in.max(1) as f32).sqrt()
}

fn fill(var: &Var, init: Fill, rng: &mut ChaCha8Rng) -> EncoderResult<()> {
    let n = var.elem_count();
    let data: Vec<f32> = match init {
        Fill::Const(value) => vec![value; n],
        Fill::Uniform(bound) => {
            let dist = Uniform::new_inclusive(-bound, bound);
            (0..n).map(|_| dist.sample(rng)).collect()
        }
    };
    let values = Tensor::from_vec(data, var.dims(), var.device())?.to_dtype(var.dtype())?;
    var.set(&values)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{linear, VarBuilder};

    fn build(var_map: &VarMap) {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu);
        linear(4, 3, vb.pp("layer")).unwrap();
        crate::norm::manual_layer_norm(3, 1e-5, vb.pp("norm")).unwrap();
    }

    fn values(var_map: &VarMap, name: &str) -> Vec<f32> {
        let data = var_map.data().lock().unwrap();
        data[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let (a, b) = (VarMap::new(), VarMap::new());
        build(&a);
        build(&b);
        reinitialize(&a, 7).unwrap();
        reinitialize(&b, 7).unwrap();
        assert_eq!(values(&a, "layer.weight"), values(&b, "layer.weight"));
        assert_eq!(values(&a, "layer.bias"), values(&b, "layer.bias"));

        reinitialize(&b, 8).unwrap();
        assert_ne!(values(&a, "layer.weight"), values(&b, "layer.weight"));
    }

    #[test]
    fn test_bounds_and_norm_reset() {
        let var_map = VarMap::new();
        build(&var_map);
        reinitialize(&var_map, 1).unwrap();
        assert!(values(&var_map, "layer.weight").iter().all(|v| v.abs() <= 0.5));
        assert!(values(&var_map, "layer.bias").iter().all(|v| v.abs() <= 0.5));
        assert_eq!(values(&var_map, "norm.weight"), vec![1.0; 3]);
        assert_eq!(values(&var_map, "norm.bias"), vec![0.0; 3]);
    }

    #[test]
    fn test_conv_fan_in() {
        assert!((fan_in_bound(&[8, 2, 3, 3]) - 1.0 / 18f32.sqrt()).abs() < 1e-6);
        assert!((fan_in_bound(&[5, 8, 16]) - 0.25).abs() < 1e-6);
    }
}
