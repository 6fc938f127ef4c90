//! Representation solvers that map basis evaluations and example outputs to
//! coefficients.
//!
//! Both solvers take `gs: (F, D, M, K)` and `ys: (F, D, M)` and return a
//! [`Representation`] with `coefficients: (F, K)`. Every function in the
//! batch is solved independently.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, EncoderResult};
use crate::inner_product::DataType;

/// Ridge term added to the Gram matrix when none is supplied.
pub const DEFAULT_LAMBDA: f64 = 1e-3;

/// Relative size under which an elimination pivot counts as zero.
const PIVOT_TOLERANCE: f64 = 1e-6;

/// Per-call options for computing a representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RepresentationOptions {
    /// Ridge regularization for least squares. `None` uses [`DEFAULT_LAMBDA`].
    #[serde(default)]
    pub lambda: Option<f64>,
}

impl RepresentationOptions {
    /// Options with an explicit ridge term.
    #[must_use]
    pub const fn with_lambda(lambda: f64) -> Self {
        Self {
            lambda: Some(lambda),
        }
    }

    /// The ridge term to use, validated to be finite and non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for a negative or non-finite
    /// value.
    pub fn resolved_lambda(&self) -> EncoderResult<f64> {
        let lambda = self.lambda.unwrap_or(DEFAULT_LAMBDA);
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(EncoderError::precondition(format!(
                "lambda must be finite and >= 0, got {lambda}"
            )));
        }
        Ok(lambda)
    }
}

/// Coefficients of a batch of functions in the learned basis.
#[derive(Debug, Clone)]
pub struct Representation {
    /// `(F, K)`, or `(K,)` from the single-function entry points.
    pub coefficients: Tensor,
    /// `(F, K, K)` Gram matrix, only produced by least squares.
    pub gram: Option<Tensor>,
}

impl Representation {
    /// Drop the leading function axis of a batch of one.
    pub(crate) fn squeeze_batch(self) -> EncoderResult<Self> {
        Ok(Self {
            coefficients: self.coefficients.squeeze(0)?,
            gram: self.gram.map(|g| g.squeeze(0)).transpose()?,
        })
    }
}

/// Coefficients as a single Monte-Carlo inner product `⟨G, y⟩`.
///
/// # Errors
///
/// Returns [`EncoderError::Precondition`] when `gs` and `ys` disagree in
/// shape.
pub fn inner_product_representation(
    data_type: DataType,
    gs: &Tensor,
    ys: &Tensor,
) -> EncoderResult<Representation> {
    check_solver_inputs(gs, ys)?;
    let coefficients = data_type.inner_product(gs, ys)?;
    Ok(Representation {
        coefficients,
        gram: None,
    })
}

/// Coefficients solving `(⟨G, G⟩ + λI) c = ⟨G, y⟩` for every function.
///
/// # Errors
///
/// Returns [`EncoderError::Precondition`] for mismatched shapes or a negative
/// `lambda`, and [`EncoderError::Numerical`] when a regularized Gram matrix is
/// singular.
pub fn least_squares_representation(
    data_type: DataType,
    gs: &Tensor,
    ys: &Tensor,
    lambda: f64,
) -> EncoderResult<Representation> {
    check_solver_inputs(gs, ys)?;
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(EncoderError::precondition(format!(
            "lambda must be finite and >= 0, got {lambda}"
        )));
    }

    let gram = data_type.inner_product(gs, gs)?;
    let rhs = data_type.inner_product(gs, ys)?;
    let k = gram.dim(1)?;

    let ridge = (identity(k, gram.dtype(), gram.device())? * lambda)?;
    let regularized = gram.broadcast_add(&ridge)?;
    let coefficients = solve(&regularized, &rhs, lambda)?;

    Ok(Representation {
        coefficients,
        gram: Some(gram),
    })
}

/// Solve `a x = b` for a batch of square systems.
///
/// `a` is `(F, K, K)` and `b` is `(F, K)`. Elimination is written entirely in
/// tensor ops so gradients flow into both `a` and `b`. No pivoting is done,
/// which is sound for the symmetric positive (semi-)definite systems the
/// least-squares solver produces.
///
/// # Errors
///
/// Returns [`EncoderError::Numerical`] when a pivot vanishes relative to the
/// diagonal of its system or the solution is not finite.
pub fn batched_solve(a: &Tensor, b: &Tensor) -> EncoderResult<Tensor> {
    solve(a, b, 0.0)
}

/// Elimination for systems known to carry a ridge of `ridge` on the diagonal.
///
/// Every pivot of a positive semi-definite matrix plus `ridge · I` is at least
/// `ridge`, so the zero-pivot tolerance never exceeds `ridge / 2`.
fn solve(a: &Tensor, b: &Tensor, ridge: f64) -> EncoderResult<Tensor> {
    let (f, k, k2) = a.dims3()?;
    if k != k2 {
        return Err(EncoderError::precondition(format!(
            "batched_solve expects square systems, got {:?}",
            a.dims()
        )));
    }
    if b.dims() != [f, k] {
        return Err(EncoderError::precondition(format!(
            "batched_solve expects a right-hand side of shape [{f}, {k}], got {:?}",
            b.dims()
        )));
    }

    let eye = identity(k, a.dtype(), a.device())?;
    let scale = a.broadcast_mul(&eye)?.sum(2)?.abs()?.max_keepdim(1)?;

    let mut aug = Tensor::cat(&[a, &b.unsqueeze(2)?], 2)?;
    let mut pivots = Vec::with_capacity(k);
    for i in 0..k {
        let row = aug.narrow(1, i, 1)?;
        let pivot = row.narrow(2, i, 1)?;
        pivots.push(pivot.squeeze(2)?);

        let row = row.broadcast_div(&pivot)?;
        let column = aug.narrow(2, i, 1)?;
        let unit = eye.narrow(0, i, 1)?.reshape((1, k, 1))?;
        aug = (aug - column.broadcast_mul(&row)?)?.broadcast_add(&unit.broadcast_mul(&row)?)?;
    }

    let pivots = Tensor::cat(&pivots, 1)?;
    check_pivots(&pivots, &scale, ridge)?;

    let solution = aug.narrow(2, k, 1)?.squeeze(2)?;
    let finite = solution
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(EncoderError::numerical(
            "least-squares solution contains non-finite values",
        ));
    }
    Ok(solution)
}

fn check_pivots(pivots: &Tensor, scale: &Tensor, ridge: f64) -> EncoderResult<()> {
    let pivots = pivots.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let scale = scale.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    for (function, (row, s)) in pivots.iter().zip(scale.iter()).enumerate() {
        let mut tolerance = PIVOT_TOLERANCE * s[0].max(f64::MIN_POSITIVE);
        if ridge > 0.0 {
            tolerance = tolerance.min(ridge / 2.0);
        }
        if let Some((index, value)) = row
            .iter()
            .enumerate()
            .find(|(_, p)| !p.is_finite() || p.abs() <= tolerance)
        {
            return Err(EncoderError::numerical(format!(
                "singular Gram matrix for function {function}: pivot {index} is {value:e}"
            )));
        }
    }
    Ok(())
}

pub(crate) fn identity(
    k: usize,
    dtype: DType,
    device: &candle_core::Device,
) -> EncoderResult<Tensor> {
    let mut data = vec![0f32; k * k];
    for i in 0..k {
        data[i * k + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (k, k), device)?.to_dtype(dtype)?)
}

fn check_solver_inputs(gs: &Tensor, ys: &Tensor) -> EncoderResult<()> {
    let (f, d, m, _) = gs.dims4().map_err(|_| {
        EncoderError::precondition(format!(
            "basis evaluations must have shape (f, d, m, k), got {:?}",
            gs.dims()
        ))
    })?;
    if ys.dims() != [f, d, m] {
        return Err(EncoderError::precondition(format!(
            "example outputs must have shape [{f}, {d}, {m}] to match the basis, got {:?}",
            ys.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Basis `1, x, x²` sampled on an even grid over [-1, 1]: `(1, n, 1, 3)`.
    fn polynomial_basis(n: usize, device: &Device) -> Tensor {
        let mut data = Vec::with_capacity(n * 3);
        for i in 0..n {
            let x = -1.0 + 2.0 * i as f32 / (n - 1) as f32;
            data.extend_from_slice(&[1.0, x, x * x]);
        }
        Tensor::from_vec(data, (1, n, 1, 3), device).unwrap()
    }

    #[test]
    fn test_batched_solve_known_system() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[4.0f32, 1.0], [1.0, 3.0]]], &device).unwrap();
        let b = Tensor::new(&[[1.0f32, 2.0]], &device).unwrap();
        let x = batched_solve(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        // exact solution (1/11, 7/11)
        assert!((x[0][0] - 1.0 / 11.0).abs() < 1e-6);
        assert!((x[0][1] - 7.0 / 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_batched_solve_is_independent_per_function() {
        let device = Device::Cpu;
        let a = Tensor::new(
            &[[[2.0f32, 0.0], [0.0, 2.0]], [[1.0, 0.0], [0.0, 4.0]]],
            &device,
        )
        .unwrap();
        let b = Tensor::new(&[[2.0f32, 4.0], [3.0, 8.0]], &device).unwrap();
        let x = batched_solve(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(x, vec![vec![1.0, 2.0], vec![3.0, 2.0]]);
    }

    #[test]
    fn test_least_squares_recovers_exact_coefficients() {
        let device = Device::Cpu;
        let gs = polynomial_basis(11, &device);
        let coefficients = [0.5f32, -1.25, 2.0];
        let target = Tensor::new(&coefficients, &device)
            .unwrap()
            .reshape((1, 1, 1, 3))
            .unwrap();
        let ys = gs.broadcast_mul(&target).unwrap().sum(3).unwrap();

        let rep = least_squares_representation(DataType::Deterministic, &gs, &ys, 0.0).unwrap();
        let found = rep.coefficients.to_vec2::<f32>().unwrap();
        for (a, b) in found[0].iter().zip(coefficients.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        assert_eq!(rep.gram.unwrap().dims(), &[1, 3, 3]);
    }

    #[test]
    fn test_least_squares_matches_inner_product_on_orthonormal_basis() {
        let device = Device::Cpu;
        // columns [1,1,1,1] and [1,-1,1,-1] are orthonormal under the mean
        let gs = Tensor::new(
            &[[[[1.0f32, 1.0]], [[1.0, -1.0]], [[1.0, 1.0]], [[1.0, -1.0]]]],
            &device,
        )
        .unwrap();
        let ys = Tensor::new(&[[[0.3f32], [-2.0], [1.1], [0.7]]], &device).unwrap();

        let ip = inner_product_representation(DataType::Deterministic, &gs, &ys).unwrap();
        let ls = least_squares_representation(DataType::Deterministic, &gs, &ys, 0.0).unwrap();
        assert!(ip.gram.is_none());
        let ip = ip.coefficients.to_vec2::<f32>().unwrap();
        let ls = ls.coefficients.to_vec2::<f32>().unwrap();
        for (a, b) in ip[0].iter().zip(ls[0].iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_singular_gram_is_numerical_failure() {
        let device = Device::Cpu;
        // two identical basis functions
        let gs = Tensor::new(&[[[[1.0f32, 1.0]], [[2.0, 2.0]], [[3.0, 3.0]]]], &device).unwrap();
        let ys = Tensor::new(&[[[1.0f32], [2.0], [3.0]]], &device).unwrap();
        let err = least_squares_representation(DataType::Deterministic, &gs, &ys, 0.0).unwrap_err();
        assert!(matches!(err, EncoderError::Numerical(_)), "{err}");

        // the ridge term makes the same system solvable
        assert!(least_squares_representation(DataType::Deterministic, &gs, &ys, 1e-3).is_ok());
    }

    #[test]
    fn test_ridge_keeps_underdetermined_large_basis_solvable() {
        let device = Device::Cpu;
        // eight basis functions seen at four points: rank-deficient Gram
        let (f, d, k) = (2, 4, 8);
        let data: Vec<f64> = (0..f * d * k)
            .map(|i| 100.0 * (((i * 7919 + 13) % 101) as f64 / 50.0 - 1.0))
            .collect();
        let gs = Tensor::from_vec(data, (f, d, 1, k), &device).unwrap();
        let targets = vec![1.0f64, -2.0, 0.5, 3.0, 0.0, 1.0, -1.0, 2.0];
        let ys = Tensor::from_vec(targets, (f, d, 1), &device).unwrap();

        let rep = least_squares_representation(DataType::Deterministic, &gs, &ys, 1e-3).unwrap();
        assert_eq!(rep.coefficients.dims(), &[f, k]);
        let fitted = gs
            .squeeze(2)
            .unwrap()
            .matmul(&rep.coefficients.unsqueeze(2).unwrap())
            .unwrap()
            .squeeze(2)
            .unwrap()
            .to_vec2::<f64>()
            .unwrap();
        let target = ys.squeeze(2).unwrap().to_vec2::<f64>().unwrap();
        for (row, expected) in fitted.iter().zip(target.iter()) {
            for (a, b) in row.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-3, "{a} vs {b}");
            }
        }

        let err =
            least_squares_representation(DataType::Deterministic, &gs, &ys, 0.0).unwrap_err();
        assert!(matches!(err, EncoderError::Numerical(_)), "{err}");
    }

    #[test]
    fn test_negative_lambda_rejected() {
        let device = Device::Cpu;
        let gs = polynomial_basis(5, &device);
        let ys = Tensor::zeros((1, 5, 1), DType::F32, &device).unwrap();
        let err =
            least_squares_representation(DataType::Deterministic, &gs, &ys, -1.0).unwrap_err();
        assert!(matches!(err, EncoderError::Precondition(_)));
        assert!(RepresentationOptions::with_lambda(-0.5).resolved_lambda().is_err());
        assert_eq!(RepresentationOptions::default().resolved_lambda().unwrap(), DEFAULT_LAMBDA);
    }

    #[test]
    fn test_mismatched_example_outputs_rejected() {
        let device = Device::Cpu;
        let gs = polynomial_basis(5, &device);
        let ys = Tensor::zeros((1, 4, 1), DType::F32, &device).unwrap();
        assert!(inner_product_representation(DataType::Deterministic, &gs, &ys).is_err());
    }

    #[test]
    fn test_solve_propagates_gradients() {
        let device = Device::Cpu;
        let a = candle_core::Var::new(&[[[2.0f32, 0.5], [0.5, 1.0]]], &device).unwrap();
        let b = candle_core::Var::new(&[[1.0f32, -1.0]], &device).unwrap();
        let x = batched_solve(a.as_tensor(), b.as_tensor()).unwrap();
        let grads = x.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(a.as_tensor()).is_some());
        assert!(grads.get(b.as_tensor()).is_some());
    }
}
