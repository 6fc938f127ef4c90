//! Sources of function batches for training.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{EncoderError, EncoderResult};
use crate::inner_product::DataType;

/// A batch of `F` functions, each observed at example and query points.
#[derive(Debug, Clone)]
pub struct FunctionBatch {
    /// `(F, De, *input)`
    pub example_xs: Tensor,
    /// `(F, De, *output)`
    pub example_ys: Tensor,
    /// `(F, Dq, *input)`
    pub query_xs: Tensor,
    /// `(F, Dq, *output)`
    pub query_ys: Tensor,
    /// Extra per-batch tensors a dataset wants to hand to callbacks
    pub info: HashMap<String, Tensor>,
}

impl FunctionBatch {
    /// Batch with an empty `info` map.
    pub fn new(example_xs: Tensor, example_ys: Tensor, query_xs: Tensor, query_ys: Tensor) -> Self {
        Self {
            example_xs,
            example_ys,
            query_xs,
            query_ys,
            info: HashMap::new(),
        }
    }

    /// Attach a named tensor.
    #[must_use]
    pub fn with_info(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.info.insert(name.into(), value);
        self
    }

    /// Copy every tensor to `device`.
    ///
    /// # Errors
    ///
    /// Propagates transfer failures.
    pub fn to_device(&self, device: &candle_core::Device) -> EncoderResult<Self> {
        let info = self
            .info
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.to_device(device)?)))
            .collect::<EncoderResult<HashMap<_, _>>>()?;
        Ok(Self {
            example_xs: self.example_xs.to_device(device)?,
            example_ys: self.example_ys.to_device(device)?,
            query_xs: self.query_xs.to_device(device)?,
            query_ys: self.query_ys.to_device(device)?,
            info,
        })
    }

    /// Number of functions `F`.
    pub fn n_functions(&self) -> usize {
        self.example_xs.dims().first().copied().unwrap_or(0)
    }

    /// Check every tensor against the declared point shapes.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] describing the first mismatch.
    pub fn validate(&self, input_size: &[usize], output_size: &[usize]) -> EncoderResult<()> {
        let f = self.n_functions();
        let de = check_points("example_xs", &self.example_xs, f, None, input_size)?;
        check_points("example_ys", &self.example_ys, f, Some(de), output_size)?;
        let dq = check_points("query_xs", &self.query_xs, f, None, input_size)?;
        check_points("query_ys", &self.query_ys, f, Some(dq), output_size)?;
        Ok(())
    }
}

/// Checks `(f, d, *point)` and returns `d`.
pub(crate) fn check_points(
    name: &str,
    tensor: &Tensor,
    f: usize,
    d: Option<usize>,
    point: &[usize],
) -> EncoderResult<usize> {
    let dims = tensor.dims();
    let shape_ok = dims.len() == point.len() + 2
        && dims[0] == f
        && d.map_or(true, |d| dims[1] == d)
        && dims[2..] == *point;
    if !shape_ok {
        let expected_d = d.map_or_else(|| "D".to_string(), |d| d.to_string());
        return Err(EncoderError::precondition(format!(
            "{name} must have shape ({f}, {expected_d}, {}), got {dims:?}",
            point.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(dims[1])
}

/// A source of training batches.
pub trait Dataset {
    /// Shape of one input point.
    fn input_size(&self) -> &[usize];

    /// Shape of one output point.
    fn output_size(&self) -> &[usize];

    /// Inner product the functions live under.
    fn data_type(&self) -> DataType;

    /// Draw a fresh batch.
    ///
    /// # Errors
    ///
    /// Implementations report their own sampling failures.
    fn sample(&mut self) -> EncoderResult<FunctionBatch>;

    /// Check the declared sizes.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] for empty or zero-sized shapes.
    fn check_dataset(&self) -> EncoderResult<()> {
        for (name, size) in [("input", self.input_size()), ("output", self.output_size())] {
            if size.is_empty() || size.contains(&0) {
                return Err(EncoderError::precondition(format!(
                    "dataset {name} size must be non-empty with positive entries, got {size:?}"
                )));
            }
        }
        Ok(())
    }
}
