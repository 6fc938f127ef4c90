//! Training loop.
//!
//! Each epoch samples one batch of functions, computes every loss term,
//! backpropagates, and every `gradient_accumulation` epochs clips the summed
//! gradients and steps the optimizer.

use candle_core::DType;
use indicatif::{ProgressBar, ProgressStyle};

use crate::callback::{StepLosses, TrainingCallback, TrainingState};
use crate::config::TrainingOptions;
use crate::dataset::{Dataset, FunctionBatch};
use crate::error::{EncoderError, EncoderResult};
use crate::model::FunctionEncoder;
use crate::optimizer::backward;
use crate::solver::RepresentationOptions;

impl FunctionEncoder {
    /// Train on batches drawn from `dataset`.
    ///
    /// Returns the total loss of every epoch. Gradients left over from a
    /// final incomplete accumulation window are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Precondition`] if the dataset disagrees with the
    /// encoder's sizes or data type, [`EncoderError::Numerical`] for a
    /// non-finite loss, and any error raised by the dataset or a callback.
    pub fn train_model<D: Dataset + ?Sized>(
        &mut self,
        dataset: &mut D,
        options: &TrainingOptions,
        mut callback: Option<&mut dyn TrainingCallback>,
    ) -> EncoderResult<Vec<f32>> {
        self.check_dataset(dataset)?;
        options.representation.resolved_lambda()?;

        tracing::info!(
            epochs = options.epochs,
            n_params = self.num_params(),
            hyperparameters = ?self.hyperparameters(),
            "starting training"
        );

        let mut history = Vec::with_capacity(options.epochs);
        if let Some(cb) = callback.as_deref_mut() {
            cb.on_training_start(&TrainingState {
                encoder: &*self,
                epoch: 0,
                epochs: options.epochs,
                losses: None,
                batch: None,
                loss_history: &history,
            })?;
        }

        let pb = options.progress_bar.then(|| progress_bar(options.epochs));

        for epoch in 0..options.epochs {
            let batch = dataset.sample()?.to_device(&self.device)?;
            let losses = self.train_step(&batch, &options.representation)?;
            history.push(losses.total);

            if let Some(pb) = &pb {
                pb.set_message(format!("{:.4}", losses.total));
                pb.inc(1);
            }
            tracing::trace!(
                epoch,
                loss = losses.total,
                prediction = losses.prediction,
                "training step"
            );

            if let Some(cb) = callback.as_deref_mut() {
                cb.on_step(&TrainingState {
                    encoder: &*self,
                    epoch: epoch + 1,
                    epochs: options.epochs,
                    losses: Some(&losses),
                    batch: Some(&batch),
                    loss_history: &history,
                })?;
            }
        }

        if self.accumulator.pending() > 0 {
            tracing::debug!(
                pending = self.accumulator.pending(),
                "dropping gradients of an incomplete accumulation window"
            );
            self.accumulator.reset();
        }
        if let Some(pb) = pb {
            pb.finish_with_message("Training complete");
        }

        if let Some(cb) = callback.as_deref_mut() {
            cb.on_training_end(&TrainingState {
                encoder: &*self,
                epoch: options.epochs,
                epochs: options.epochs,
                losses: None,
                batch: None,
                loss_history: &history,
            })?;
        }
        tracing::info!(
            epochs = options.epochs,
            final_loss = history.last().copied(),
            "training complete"
        );
        Ok(history)
    }

    /// One forward/backward pass on `batch`, stepping the optimizer when the
    /// accumulation window is full.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Numerical`] for a non-finite total loss.
    pub fn train_step(
        &mut self,
        batch: &FunctionBatch,
        options: &RepresentationOptions,
    ) -> EncoderResult<StepLosses> {
        let losses = self.training_losses(batch, options)?;
        let total = scalar(&losses.total)?;
        if !total.is_finite() {
            return Err(EncoderError::numerical(format!("training loss is {total}")));
        }
        let mut step = StepLosses {
            total,
            prediction: scalar(&losses.prediction)?,
            orthonormality: losses.orthonormality.as_ref().map(scalar).transpose()?,
            average_function: losses.average_function.as_ref().map(scalar).transpose()?,
            grad_norm: None,
        };

        let vars = self.var_map.all_vars();
        self.accumulator.accumulate(backward(&losses.total)?, &vars)?;
        if self.accumulator.pending() >= self.config.gradient_accumulation {
            let norm = self.accumulator.clip(&vars, self.config.max_grad_norm)?;
            self.accumulator.apply(&mut self.optimizer)?;
            tracing::debug!(grad_norm = norm, loss = total, "optimizer step");
            step.grad_norm = Some(norm);
        }
        Ok(step)
    }

    fn check_dataset<D: Dataset + ?Sized>(&self, dataset: &D) -> EncoderResult<()> {
        dataset.check_dataset()?;
        if dataset.input_size() != self.config.input_size.as_slice()
            || dataset.output_size() != self.config.output_size.as_slice()
        {
            return Err(EncoderError::precondition(format!(
                "dataset sizes {:?} -> {:?} do not match encoder sizes {:?} -> {:?}",
                dataset.input_size(),
                dataset.output_size(),
                self.config.input_size,
                self.config.output_size
            )));
        }
        if dataset.data_type() != self.config.data_type {
            return Err(EncoderError::precondition(format!(
                "dataset is {} but encoder is {}",
                dataset.data_type(),
                self.config.data_type
            )));
        }
        Ok(())
    }
}

fn scalar(t: &candle_core::Tensor) -> EncoderResult<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

fn progress_bar(epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(epochs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}
