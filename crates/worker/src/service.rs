//! Service orchestration
//!
//! Wires the preprocessing pool into the batching worker, assigns request ids,
//! answers every submission with a latency estimate and exposes the outcome
//! stream.

use crate::batching::BatchingWorker;
use crate::engine::{EngineRegistry, InferenceEngine};
use crate::estimate::{Estimate, LatencyEstimator};
use crate::events::EventSink;
use crate::preprocess::{ImageConverter, ImageConvertor, InputSink, Payload, PreprocessingPool};
use crossbeam::channel::Receiver;
use skinscan_common::{Result, ServiceError, Settings, METRICS};
use skinscan_proto::{RequestInfo, ServiceEvent};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Image classification pipeline
pub struct Service {
    pool: PreprocessingPool,
    batching: Arc<BatchingWorker>,
    estimate: Estimate,
    last_id: AtomicU64,
    events: Receiver<ServiceEvent>,
}

impl Service {
    /// Build the engine through `registry`, derive the image geometry from it,
    /// and calibrate the latency estimate
    ///
    /// Every failure here is fatal to startup.
    pub fn build(settings: &Settings, registry: &EngineRegistry) -> Result<Self> {
        settings.service.validate()?;

        let mut engine = registry.create(&settings.tensor)?;

        let mut image = settings.image.clone();
        image.set_geometry(
            to_u32(engine.input_width(), "width")?,
            to_u32(engine.input_height(), "height")?,
            engine.input_channels(),
        );
        let convertor = ImageConvertor::new(image)?;

        let estimate = LatencyEstimator::measure(
            &convertor,
            settings.image.count_tests_for_estimate,
            engine.as_mut(),
            settings.tensor.count_tests_for_estimate,
        )?;

        info!(
            "Service built: preprocessing {} ns, inference {} ns per round",
            estimate.preprocessing_ns, estimate.inference_ns
        );

        Ok(Self::from_parts(
            engine,
            Arc::new(convertor),
            settings.service.preprocessing_threads(),
            estimate,
        ))
    }

    /// Assemble a service from already-built components
    pub fn from_parts(
        engine: Box<dyn InferenceEngine>,
        converter: Arc<dyn ImageConverter>,
        threads: usize,
        estimate: Estimate,
    ) -> Self {
        let (sink, events) = EventSink::channel();
        let batching = Arc::new(BatchingWorker::new(engine, sink.clone()));
        let input_sink: Arc<dyn InputSink> = batching.clone();
        let pool = PreprocessingPool::new(converter, input_sink, sink, threads);

        Self {
            pool,
            batching,
            estimate,
            last_id: AtomicU64::new(0),
            events,
        }
    }

    /// Start both stages
    ///
    /// If batching cannot start, preprocessing is stopped again.
    pub fn start(&self) -> Result<()> {
        self.pool.start()?;
        if let Err(e) = self.batching.start() {
            error!("Batching worker failed to start: {}", e);
            self.pool.stop();
            return Err(e);
        }
        info!("Service started");
        Ok(())
    }

    /// Stop preprocessing (its output still reaches the batching queue), then
    /// batching; returns once every accepted request has an outcome
    pub fn stop(&self) -> Result<()> {
        self.pool.stop();
        self.batching.stop()?;
        info!("Service stopped");
        Ok(())
    }

    /// Check if both stages run
    pub fn is_running(&self) -> bool {
        self.pool.state().is_running() && self.batching.state().is_running()
    }

    /// Submit a payload; the outcome arrives on [`Service::events`]
    pub fn request(&self, payload: Payload) -> RequestInfo {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let estimate_ms = self.estimate_next_request();

        match &payload {
            Payload::Bytes(data) => info!(
                "Request received: {} data size {} estimate {} ms",
                id,
                data.len(),
                estimate_ms
            ),
            Payload::Path(path) => info!(
                "Request received: {} image path {} estimate {} ms",
                id,
                path.display(),
                estimate_ms
            ),
        }
        METRICS.requests.requests_total.inc();
        METRICS.requests.estimate_ms.observe(estimate_ms as f64);

        self.pool.submit(id, payload);

        RequestInfo { id, estimate_ms }
    }

    /// Submit encoded image bytes
    pub fn request_bytes(&self, data: Vec<u8>) -> RequestInfo {
        self.request(Payload::Bytes(data))
    }

    /// Submit the path of an image on this host
    pub fn request_path(&self, path: impl Into<PathBuf>) -> RequestInfo {
        self.request(Payload::Path(path.into()))
    }

    /// Outcome stream; every accepted id produces exactly one event
    ///
    /// Receivers share one queue, so each event reaches only one of them.
    pub fn events(&self) -> Receiver<ServiceEvent> {
        self.events.clone()
    }

    /// Calibrated per-stage costs
    pub fn estimate(&self) -> Estimate {
        self.estimate
    }

    /// Predicted latency in milliseconds for a request submitted now
    pub fn estimate_next_request(&self) -> i64 {
        self.estimate.request_ms(
            self.pool.queue_depth(),
            self.batching.queue_depth(),
            self.batching.max_batches(),
        )
    }

    /// Jobs waiting in or running through preprocessing
    pub fn preprocessing_depth(&self) -> usize {
        self.pool.queue_depth()
    }

    /// Entries waiting for a batch slot
    pub fn inference_depth(&self) -> usize {
        self.batching.queue_depth()
    }
}

fn to_u32(value: usize, name: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ServiceError::config(format!("Engine input {} {} is too large", name, value)))
}
