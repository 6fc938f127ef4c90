//! Shared test datasets.

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use function_encoder_rs::{DataType, Dataset, EncoderResult, FunctionBatch};
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Quadratics `a + b x + c x^2` with coefficients and inputs uniform in [-1, 1].
pub struct Quadratics {
    rng: ChaCha8Rng,
    pub n_functions: usize,
    pub n_examples: usize,
    pub n_queries: usize,
    device: Device,
}

impl Quadratics {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            n_functions: 10,
            n_examples: 40,
            n_queries: 60,
            device: Device::Cpu,
        }
    }

    fn points(&mut self, n: usize) -> Vec<f32> {
        let dist = Uniform::new_inclusive(-1.0f32, 1.0);
        (0..n).map(|_| dist.sample(&mut self.rng)).collect()
    }

    fn evaluate(coefficients: &[[f32; 3]], xs: &[f32], per_function: usize) -> Vec<f32> {
        xs.iter()
            .enumerate()
            .map(|(i, x)| {
                let [a, b, c] = coefficients[i / per_function];
                a + b * x + c * x * x
            })
            .collect()
    }
}

impl Dataset for Quadratics {
    fn input_size(&self) -> &[usize] {
        &[1]
    }

    fn output_size(&self) -> &[usize] {
        &[1]
    }

    fn data_type(&self) -> DataType {
        DataType::Deterministic
    }

    fn sample(&mut self) -> EncoderResult<FunctionBatch> {
        let (f, de, dq) = (self.n_functions, self.n_examples, self.n_queries);
        let raw = self.points(3 * f);
        let coefficients: Vec<[f32; 3]> = raw.chunks(3).map(|c| [c[0], c[1], c[2]]).collect();

        let example_xs = self.points(f * de);
        let query_xs = self.points(f * dq);
        let example_ys = Self::evaluate(&coefficients, &example_xs, de);
        let query_ys = Self::evaluate(&coefficients, &query_xs, dq);

        let device = &self.device;
        Ok(FunctionBatch::new(
            Tensor::from_vec(example_xs, (f, de, 1), device)?,
            Tensor::from_vec(example_ys, (f, de, 1), device)?,
            Tensor::from_vec(query_xs, (f, dq, 1), device)?,
            Tensor::from_vec(query_ys, (f, dq, 1), device)?,
        )
        .with_info("coefficients", Tensor::from_vec(raw, (f, 3), device)?))
    }
}

/// Evenly spaced points on [-1, 1], shaped `(f, d, 1)`.
pub fn grid(f: usize, d: usize) -> Tensor {
    let xs: Vec<f32> = (0..d)
        .map(|i| -1.0 + 2.0 * i as f32 / (d - 1) as f32)
        .collect();
    Tensor::from_vec(xs, (1, d, 1), &Device::Cpu)
        .unwrap()
        .repeat((f, 1, 1))
        .unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}
