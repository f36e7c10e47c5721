//! Dense classifier backend
//!
//! Scores each slot with `softmax(W · x + b)` where `W` is `[output, input_n]`.
//! Weights come from a safetensors file holding `weight` and `bias`.

use super::{
    validate_infer, validate_load_input, validate_unload_output, EngineError, EngineResult,
    InferenceEngine,
};
use crate::tensor::{matvec, softmax_in_place, SafeTensorBuffer, Tensor};
use rayon::prelude::*;
use skinscan_common::config::{BackendSettings, EngineSettings, LinearSettings};
use skinscan_common::{Result, ServiceError};
use tracing::{debug, info};

/// CPU linear classifier
pub struct LinearEngine {
    settings: LinearSettings,
    max_batches: usize,
    positive_index: usize,
    negative_index: usize,
    weight: Tensor<f32>,
    bias: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    /// Slots covered by the last successful `infer`
    inferred: usize,
}

impl LinearEngine {
    /// Load weights for `linear` engine settings
    pub fn load(settings: &EngineSettings) -> Result<Self> {
        let linear = match &settings.backend {
            BackendSettings::Linear(linear) => linear.clone(),
            other => {
                return Err(ServiceError::engine(format!(
                    "Linear engine cannot use '{}' settings",
                    other.kind()
                )))
            }
        };

        info!("Loading linear weights from {}", linear.weights_path.display());
        let buffer = SafeTensorBuffer::open(&linear.weights_path)?;

        let input_n = linear.width * linear.height * linear.channels;

        let weight = buffer.get_tensor("weight")?.to_f32()?;
        if weight.shape != [linear.output, input_n] {
            return Err(ServiceError::engine(format!(
                "weight shape {:?} does not match [{}, {}]",
                weight.shape, linear.output, input_n
            )));
        }

        let bias = buffer.get_tensor("bias")?.to_f32()?;
        if bias.shape != [linear.output] {
            return Err(ServiceError::engine(format!(
                "bias shape {:?} does not match [{}]",
                bias.shape, linear.output
            )));
        }

        Ok(Self {
            max_batches: settings.max_batches,
            positive_index: settings.positive_index,
            negative_index: settings.negative_index,
            weight,
            bias: bias.data,
            input: vec![0.0; settings.max_batches * input_n],
            output: vec![0.0; settings.max_batches * linear.output],
            inferred: 0,
            settings: linear,
        })
    }
}

impl InferenceEngine for LinearEngine {
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
        debug!("Linear infer over {} slots", batches);

        let input_n = self.batch_input_n();
        let output_n = self.batch_output_n();
        let softmax = self.settings.softmax;
        let weight = &self.weight;
        let bias = &self.bias;

        self.output[..batches * output_n]
            .par_chunks_mut(output_n)
            .zip(self.input[..batches * input_n].par_chunks(input_n))
            .for_each(|(out, x)| {
                matvec(weight, bias, x, out);
                if softmax {
                    softmax_in_place(out);
                }
            });

        if self.output[..batches * output_n].iter().any(|v| !v.is_finite()) {
            self.inferred = 0;
            return Err(EngineError::Backend("non-finite output".to_string()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    // 1x2x1 input, two classes: class 0 follows pixel 0, class 1 follows pixel 1
    fn write_weights(path: &Path) {
        let weight = vec![1.0f32, 0.0, 0.0, 1.0];
        let bias = vec![0.0f32, 0.0];
        SafeTensorBuffer::save_f32(
            path,
            &[
                ("weight", vec![2, 2], weight.as_slice()),
                ("bias", vec![2], bias.as_slice()),
            ],
        )
        .unwrap();
    }

    fn settings(path: &Path, softmax: bool) -> EngineSettings {
        EngineSettings {
            max_batches: 2,
            positive_index: 0,
            negative_index: 1,
            count_tests_for_estimate: 1,
            backend: BackendSettings::Linear(LinearSettings {
                width: 2,
                height: 1,
                channels: 1,
                output: 2,
                weights_path: path.to_path_buf(),
                softmax,
            }),
        }
    }

    #[test]
    fn test_linear_forward() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_weights(&path);

        let mut engine = LinearEngine::load(&settings(&path, false)).unwrap();
        engine.load_to_input(0, 0, &[3.0, 1.0]).unwrap();
        engine.load_to_input(1, 0, &[0.0]).unwrap();
        engine.load_to_input(1, 1, &[2.0]).unwrap();
        engine.infer(2).unwrap();

        let mut out = vec![0.0; 4];
        engine.unload_output(2, &mut out).unwrap();
        assert_eq!(out, vec![3.0, 1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_linear_softmax() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_weights(&path);

        let mut engine = LinearEngine::load(&settings(&path, true)).unwrap();
        engine.load_to_input(0, 0, &[1.0, 1.0]).unwrap();
        engine.infer(1).unwrap();

        let mut out = vec![0.0; 2];
        engine.unload_output(1, &mut out).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_linear_unload_before_infer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_weights(&path);

        let mut engine = LinearEngine::load(&settings(&path, true)).unwrap();
        let mut out = vec![0.0; 4];
        assert!(matches!(
            engine.unload_output(1, &mut out),
            Err(EngineError::NotInferred { .. })
        ));

        engine.load_to_input(0, 0, &[1.0, 0.0]).unwrap();
        engine.infer(1).unwrap();
        assert!(engine.unload_output(2, &mut out).is_err());
        assert!(engine.unload_output(1, &mut out).is_ok());
    }

    #[test]
    fn test_linear_rejects_bad_calls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_weights(&path);

        let mut engine = LinearEngine::load(&settings(&path, true)).unwrap();
        assert!(engine.load_to_input(2, 0, &[1.0]).is_err());
        assert!(engine.load_to_input(0, 1, &[1.0, 1.0]).is_err());
        assert!(engine.infer(0).is_err());
        assert!(engine.infer(3).is_err());
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_weights(&path);

        let mut settings = settings(&path, true);
        if let BackendSettings::Linear(linear) = &mut settings.backend {
            linear.width = 3;
        }
        assert!(matches!(
            LinearEngine::load(&settings),
            Err(ServiceError::Engine(_))
        ));
    }

    #[test]
    fn test_linear_missing_weights() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.safetensors");
        assert!(matches!(
            LinearEngine::load(&settings(&path, true)),
            Err(ServiceError::Tensor(_))
        ));
    }
}
