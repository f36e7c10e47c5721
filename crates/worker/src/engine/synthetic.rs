//! Model-free backend for smoke tests and pipeline benchmarks
//!
//! Each slot scores `softmax([m, -m, 0, ...])` where `m` is the mean of its
//! input, so brighter (post-normalisation) images lean positive.

use super::{
    validate_infer, validate_load_input, validate_unload_output, EngineError, EngineResult,
    InferenceEngine,
};
use crate::tensor::softmax_in_place;
use skinscan_common::config::{BackendSettings, EngineSettings, SyntheticSettings};
use skinscan_common::{Result, ServiceError};
use std::time::Duration;

/// Deterministic scorer with an optional simulated device delay
pub struct SyntheticEngine {
    settings: SyntheticSettings,
    max_batches: usize,
    positive_index: usize,
    negative_index: usize,
    input: Vec<f32>,
    output: Vec<f32>,
    inferred: usize,
}

impl SyntheticEngine {
    /// Build the engine for `synthetic` engine settings
    pub fn load(settings: &EngineSettings) -> Result<Self> {
        let synthetic = match &settings.backend {
            BackendSettings::Synthetic(synthetic) => synthetic.clone(),
            other => {
                return Err(ServiceError::engine(format!(
                    "Synthetic engine cannot use '{}' settings",
                    other.kind()
                )))
            }
        };

        let input_n = synthetic.width * synthetic.height * synthetic.channels;

        Ok(Self {
            max_batches: settings.max_batches,
            positive_index: settings.positive_index,
            negative_index: settings.negative_index,
            input: vec![0.0; settings.max_batches * input_n],
            output: vec![0.0; settings.max_batches * synthetic.output],
            inferred: 0,
            settings: synthetic,
        })
    }
}

impl InferenceEngine for SyntheticEngine {
    fn max_batches(&self) -> usize {
        self.max_batches
    }

    fn input_width(&self) -> usize {
        self.settings.width
    }

    fn input_height(&self) -> usize {
        self.settings.height
    }

    fn input_channels(&self) -> usize {
        self.settings.channels
    }

    fn output_size(&self) -> usize {
        self.settings.output
    }

    fn positive_index(&self) -> usize {
        self.positive_index
    }

    fn negative_index(&self) -> usize {
        self.negative_index
    }

    fn load_to_input(&mut self, batch: usize, offset: usize, src: &[f32]) -> EngineResult<()> {
        validate_load_input(self, batch, offset, src.len())?;

        let start = batch * self.batch_input_n() + offset;
        self.input[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn infer(&mut self, batches: usize) -> EngineResult<()> {
        validate_infer(self, batches)?;

        if self.settings.infer_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.settings.infer_delay_ms));
        }

        let input_n = self.batch_input_n();
        let output_n = self.batch_output_n();

        for slot in 0..batches {
            let x = &self.input[slot * input_n..(slot + 1) * input_n];
            let mean = x.iter().sum::<f32>() / input_n as f32;
            if !mean.is_finite() {
                self.inferred = 0;
                return Err(EngineError::Backend(format!("slot {} has non-finite input", slot)));
            }

            let out = &mut self.output[slot * output_n..(slot + 1) * output_n];
            out.fill(0.0);
            out[0] = mean;
            out[1] = -mean;
            softmax_in_place(out);
        }

        self.inferred = batches;
        Ok(())
    }

    fn unload_output(&mut self, batches: usize, dst: &mut [f32]) -> EngineResult<()> {
        validate_unload_output(self, batches, dst)?;
        if batches > self.inferred {
            return Err(EngineError::NotInferred {
                requested: batches,
                inferred: self.inferred,
            });
        }

        let n = batches * self.batch_output_n();
        dst[..n].copy_from_slice(&self.output[..n]);
        Ok(())
    }
}
