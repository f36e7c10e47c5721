//! Startup latency calibration
//!
//! Both stages are timed once on synthetic work before the service accepts
//! requests. The per-request estimate is then computed from the current queue
//! depths without touching either stage.

use crate::engine::InferenceEngine;
use crate::preprocess::ImageConvertor;
use skinscan_common::{Result, ServiceError};
use std::time::Instant;
use tracing::{error, info};

/// Measured per-unit costs in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// One preprocessing job
    pub preprocessing_ns: u64,

    /// One full inference round of `max_batches` slots
    pub inference_ns: u64,
}

impl Estimate {
    pub fn new(preprocessing_ns: u64, inference_ns: u64) -> Self {
        Self {
            preprocessing_ns,
            inference_ns,
        }
    }

    /// Predicted latency in milliseconds for a request submitted now
    ///
    /// The new request waits behind `preprocessing_depth` jobs, then behind
    /// everything ahead of it in the batching queue, in rounds of
    /// `max_batches`.
    pub fn request_ms(
        &self,
        preprocessing_depth: usize,
        inference_depth: usize,
        max_batches: usize,
    ) -> i64 {
        let preprocessing = preprocessing_depth as u64 + 1;
        let total = preprocessing + inference_depth as u64;
        let rounds = total.div_ceil(max_batches.max(1) as u64);

        let nanos = preprocessing as u128 * self.preprocessing_ns as u128
            + rounds as u128 * self.inference_ns as u128;
        (nanos / 1_000_000).min(i64::MAX as u128) as i64
    }
}

/// Times both stages on synthetic input
pub struct LatencyEstimator;

impl LatencyEstimator {
    /// Average cost of one conversion of a synthetic image at the target
    /// resolution, doubled to account for decoding
    pub fn measure_preprocessing(convertor: &ImageConvertor, rounds: usize) -> Result<u64> {
        info!("Estimate prepare starting");
        let rounds = rounds.max(1);
        let source = convertor.synthetic_image();

        let started = Instant::now();
        for _ in 0..rounds {
            convertor.prepare(&source).map_err(|e| {
                error!("Estimate prepare failed: {}", e);
                ServiceError::estimate(format!("Failed to estimate image convertor: {}", e))
            })?;
        }
        let per_run = started.elapsed().as_nanos() / rounds as u128;
        let nanos = (per_run * 2).min(u64::MAX as u128) as u64;

        info!("Estimate prepare completed: {} nanoseconds", nanos);
        Ok(nanos)
    }

    /// Average cost of a full load/infer/unload round over every slot
    pub fn measure_inference(engine: &mut dyn InferenceEngine, rounds: usize) -> Result<u64> {
        info!("Estimate infer starting");
        let rounds = rounds.max(1);
        let max_batches = engine.max_batches();
        let dummy_input = vec![0.0f32; engine.batch_input_n()];
        let mut dummy_output = vec![0.0f32; max_batches * engine.batch_output_n()];

        let failed = |e: crate::engine::EngineError| {
            error!("Estimate infer failed: {}", e);
            ServiceError::estimate(format!("Failed to estimate tensor engine: {}", e))
        };

        let started = Instant::now();
        for _ in 0..rounds {
            for slot in 0..max_batches {
                engine.load_to_input(slot, 0, &dummy_input).map_err(failed)?;
            }
            engine.infer(max_batches).map_err(failed)?;
            engine
                .unload_output(max_batches, &mut dummy_output)
                .map_err(failed)?;
        }
        let nanos = (started.elapsed().as_nanos() / rounds as u128).min(u64::MAX as u128) as u64;

        info!("Estimate infer completed: {} nanoseconds", nanos);
        Ok(nanos)
    }

    /// Measure both stages
    pub fn measure(
        convertor: &ImageConvertor,
        preprocessing_rounds: usize,
        engine: &mut dyn InferenceEngine,
        inference_rounds: usize,
    ) -> Result<Estimate> {
        let preprocessing_ns = Self::measure_preprocessing(convertor, preprocessing_rounds)?;
        let inference_ns = Self::measure_inference(engine, inference_rounds)?;
        Ok(Estimate::new(preprocessing_ns, inference_ns))
    }
}
