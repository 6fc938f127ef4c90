//! Monte-Carlo inner products over batches of function evaluations.
//!
//! Function evaluations are laid out as `(F, D, M)` for a single function per
//! batch entry or `(F, D, M, K)` for a set of `K` functions (typically the
//! basis). `F` is the number of functions, `D` the number of datapoints and
//! `M` the output dimension (or the number of categories).
//!
//! The three [`DataType`]s differ only in how the operands are centred before
//! the product is averaged over the datapoints:
//!
//! - `Deterministic`: no centring, the scaled L2 inner product.
//! - `Stochastic`: centred over `D`, for log-density outputs with `M = 1`.
//! - `Categorical`: centred over `M`, for conditional distributions over
//!   discrete outcomes.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, EncoderResult};

/// Selects the Hilbert space the encoder works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Plain L2 inner product.
    Deterministic,
    /// Inner product of mean-centred log densities.
    Stochastic,
    /// Inner product centred over the category axis.
    Categorical,
}

impl DataType {
    /// Lowercase name, as used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Stochastic => "stochastic",
            Self::Categorical => "categorical",
        }
    }

    /// Inner product between `fs` and `gs`.
    ///
    /// Returns `(F, Kf, Kg)`. The `Kf` axis is absent when `fs` has rank 3
    /// and the `Kg` axis is absent when `gs` has rank 3.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] when either operand is not rank
    /// 3 or 4, when `F`, `D` or `M` differ, or when a stochastic operand has
    /// `M != 1`.
    pub fn inner_product(self, fs: &Tensor, gs: &Tensor) -> EncoderResult<Tensor> {
        check_operands(self, fs, gs)?;
        let (f, d, m, kf) = as_rank4(fs)?;
        let (_, _, _, kg) = as_rank4(gs)?;

        let fs4 = self.center(&fs.reshape((f, d, m, kf))?)?;
        let gs4 = self.center(&gs.reshape((f, d, m, kg))?)?;

        let lhs = fs4.reshape((f, d * m, kf))?.transpose(1, 2)?.contiguous()?;
        let rhs = gs4.reshape((f, d * m, kg))?.contiguous()?;
        let mut ip = (lhs.matmul(&rhs)? / d as f64)?;

        if gs.rank() == 3 {
            ip = ip.squeeze(2)?;
        }
        if fs.rank() == 3 {
            ip = ip.squeeze(1)?;
        }
        Ok(ip)
    }

    /// Hilbert norm of each function in `fs`.
    ///
    /// `(F, D, M)` gives `(F,)`; `(F, D, M, K)` gives the norm of every
    /// column, `(F, K)`. The squared norm is never negative.
    ///
    /// # Errors
    ///
    /// Same preconditions as [`DataType::inner_product`].
    pub fn norm(self, fs: &Tensor, squared: bool) -> EncoderResult<Tensor> {
        check_operands(self, fs, fs)?;
        let (f, d, m, k) = as_rank4(fs)?;
        let centered = self.center(&fs.reshape((f, d, m, k))?)?;
        let mut norm_sq = (centered.sqr()?.sum(2)?.sum(1)? / d as f64)?;
        if fs.rank() == 3 {
            norm_sq = norm_sq.squeeze(1)?;
        }
        if squared {
            Ok(norm_sq)
        } else {
            Ok(norm_sq.sqrt()?)
        }
    }

    /// Hilbert distance `‖fs − gs‖` per function.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] when the operands differ in
    /// shape.
    pub fn distance(self, fs: &Tensor, gs: &Tensor, squared: bool) -> EncoderResult<Tensor> {
        if fs.dims() != gs.dims() {
            return Err(EncoderError::precondition(format!(
                "distance operands must share a shape, got {:?} and {:?}",
                fs.dims(),
                gs.dims()
            )));
        }
        self.norm(&(fs - gs)?, squared)
    }

    fn center(self, xs: &Tensor) -> EncoderResult<Tensor> {
        let centered = match self {
            Self::Deterministic => xs.clone(),
            Self::Stochastic => xs.broadcast_sub(&xs.mean_keepdim(1)?)?,
            Self::Categorical => xs.broadcast_sub(&xs.mean_keepdim(2)?)?,
        };
        Ok(centered)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn as_rank4(xs: &Tensor) -> EncoderResult<(usize, usize, usize, usize)> {
    match *xs.dims() {
        [f, d, m] => Ok((f, d, m, 1)),
        [f, d, m, k] => Ok((f, d, m, k)),
        _ => Err(EncoderError::precondition(format!(
            "expected shape (f, d, m) or (f, d, m, k), got {:?}",
            xs.dims()
        ))),
    }
}

fn check_operands(data_type: DataType, fs: &Tensor, gs: &Tensor) -> EncoderResult<()> {
    let (f1, d1, m1, _) = as_rank4(fs)?;
    let (f2, d2, m2, _) = as_rank4(gs)?;
    if f1 != f2 {
        return Err(EncoderError::precondition(format!(
            "inner product operands disagree on the number of functions: {f1} vs {f2}"
        )));
    }
    if d1 != d2 {
        return Err(EncoderError::precondition(format!(
            "inner product operands disagree on the number of datapoints: {d1} vs {d2}"
        )));
    }
    if m1 != m2 {
        return Err(EncoderError::precondition(format!(
            "inner product operands disagree on the output size: {m1} vs {m2}"
        )));
    }
    if d1 == 0 {
        return Err(EncoderError::precondition("inner product needs at least one datapoint"));
    }
    if data_type == DataType::Stochastic && m1 != 1 {
        return Err(EncoderError::precondition(format!(
            "stochastic inner product requires an output size of 1, got {m1}"
        )));
    }
    Ok(())
}
