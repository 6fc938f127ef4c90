//! Basis of fixed vectors in `R^M`, independent of the input.
//!
//! Useful when every "function" is a single point in a Euclidean space: the
//! learned basis is simply `K` vectors and the representation their
//! coordinates.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use super::{Architecture, Role};
use crate::error::EncoderResult;

/// Input-independent basis vectors.
#[derive(Debug, Clone)]
pub struct Euclidean {
    /// `(M, K)` in the basis role, `(M,)` in the average role
    vectors: Tensor,
    output_size: usize,
    role: Role,
}

impl Euclidean {
    /// Allocate `M * K` (or `M`) trainable entries.
    pub fn new(m: usize, role: Role, vb: VarBuilder) -> EncoderResult<Self> {
        let init = Init::Uniform { lo: -1.0, up: 1.0 };
        let vectors = match role {
            Role::Basis { n_basis } => vb.get_with_hints((m, n_basis), "vectors", init)?,
            Role::Average => vb.get_with_hints(m, "vectors", init)?,
        };
        Ok(Self {
            vectors,
            output_size: m,
            role,
        })
    }
}

impl Architecture for Euclidean {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dims = xs.dims();
        if dims.len() < 3 {
            candle_core::bail!("expected inputs of shape (f, d, *input), got {dims:?}");
        }
        let (f, d, m) = (dims[0], dims[1], self.output_size);
        match self.role {
            Role::Basis { n_basis } => self
                .vectors
                .reshape((1, 1, m, n_basis))?
                .broadcast_as((f, d, m, n_basis))?
                .contiguous(),
            Role::Average => self
                .vectors
                .reshape((1, 1, m))?
                .broadcast_as((f, d, m))?
                .contiguous(),
        }
    }

    fn role(&self) -> Role {
        self.role
    }
}
