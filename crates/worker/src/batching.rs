//! Batching inference worker
//!
//! Preprocessed requests wait in a FIFO queue. A single thread owns the engine,
//! takes up to `max_batches` queued entries at a time and runs them through one
//! load/infer/unload cycle, so engine calls never overlap.

use crate::engine::{EngineError, EngineResult, InferenceEngine};
use crate::events::EventSink;
use crate::input::EngineInputData;
use crate::lifecycle::WorkerState;
use crate::preprocess::InputSink;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use skinscan_common::metrics::LatencyTimer;
use skinscan_common::{Result, ServiceError, METRICS};
use skinscan_proto::{ErrorCode, RequestId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// A preprocessed request waiting for a batch slot
#[derive(Debug)]
pub struct QueueEntry {
    pub id: RequestId,
    pub data: EngineInputData,
}

/// Entries taken together for one inference call
#[derive(Debug)]
pub struct RequestBatch {
    pub entries: Vec<QueueEntry>,
    pub creation_time: Instant,
}

impl RequestBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            creation_time: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time since the batch was formed
    pub fn age(&self) -> Duration {
        self.creation_time.elapsed()
    }
}

struct BatchingInner {
    state: WorkerState,
    sender: Option<Sender<QueueEntry>>,
    receiver: Option<Receiver<QueueEntry>>,
    /// Engine while the loop is not running
    engine: Option<Box<dyn InferenceEngine>>,
    /// Loop thread; hands the engine back when it finishes
    handle: Option<JoinHandle<Box<dyn InferenceEngine>>>,
}

/// Single-threaded batching stage that owns the inference engine
pub struct BatchingWorker {
    max_batches: usize,
    events: EventSink,
    depth: Arc<AtomicUsize>,
    inner: Mutex<BatchingInner>,
}

impl BatchingWorker {
    /// Create a stopped worker; pushes made before `start` are queued
    pub fn new(engine: Box<dyn InferenceEngine>, events: EventSink) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            max_batches: engine.max_batches(),
            events,
            depth: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(BatchingInner {
                state: WorkerState::Stopped,
                sender: Some(sender),
                receiver: Some(receiver),
                engine: Some(engine),
                handle: None,
            }),
        }
    }

    /// Largest batch handed to the engine
    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// Entries waiting for a batch slot
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Start the batching thread
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != WorkerState::Stopped {
            warn!("Batching worker start ignored, worker is {}", inner.state);
            return Ok(());
        }
        inner.state = WorkerState::Starting;

        if inner.sender.is_none() {
            let (sender, receiver) = unbounded();
            inner.sender = Some(sender);
            inner.receiver = Some(receiver);
        }

        let (engine, receiver) = match (inner.engine.take(), inner.receiver.take()) {
            (Some(engine), Some(receiver)) => (engine, receiver),
            (engine, receiver) => {
                inner.engine = engine;
                inner.receiver = receiver;
                inner.state = WorkerState::Stopped;
                return Err(ServiceError::internal(
                    "Batching worker has no engine or queue to start with",
                ));
            }
        };

        let events = self.events.clone();
        let depth = Arc::clone(&self.depth);

        let handle = thread::Builder::new()
            .name("skinscan-batching".to_string())
            .spawn(move || BatchLoop::new(engine, receiver, events, depth).run())
            .map_err(|e| {
                inner.state = WorkerState::Stopped;
                ServiceError::internal(format!("Failed to spawn batching thread: {}", e))
            })?;

        inner.handle = Some(handle);
        inner.state = WorkerState::Running;
        info!("Batching worker started, max batches {}", self.max_batches);
        Ok(())
    }

    /// Refuse new entries, process every queued one and join the thread
    pub fn stop(&self) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Running {
                warn!("Batching worker stop ignored, worker is {}", inner.state);
                return Ok(());
            }
            inner.state = WorkerState::Stopping;
            inner.sender = None;
            inner.handle.take()
        };

        info!("Stopping batching worker, {} entries left to drain", self.queue_depth());

        let engine = match handle.map(JoinHandle::join) {
            Some(Ok(engine)) => Some(engine),
            Some(Err(_)) => {
                error!("Batching thread panicked, engine is lost");
                None
            }
            None => None,
        };

        let mut inner = self.inner.lock();
        let recovered = engine.is_some();
        inner.engine = engine;
        inner.state = WorkerState::Stopped;
        drop(inner);

        if !recovered {
            return Err(ServiceError::internal("Batching thread did not return the engine"));
        }

        info!("Batching worker stopped");
        Ok(())
    }

    /// Queue a preprocessed request; returns false (after emitting
    /// `ServiceStopping`) if the worker is stopping
    pub fn push(&self, id: RequestId, data: EngineInputData) -> bool {
        let inner = self.inner.lock();

        let sender = match (&inner.state, &inner.sender) {
            (WorkerState::Stopping, _) | (_, None) => None,
            (_, Some(sender)) => Some(sender),
        };

        let accepted = match sender {
            Some(sender) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                if sender.send(QueueEntry { id, data }).is_ok() {
                    true
                } else {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
            None => false,
        };
        drop(inner);

        if accepted {
            trace!("Request {} queued for inference", id);
            METRICS.inference.queue_depth.set(self.queue_depth() as i64);
        } else {
            warn!("Request {} rejected, batching worker is stopping", id);
            self.events.rejected(id);
        }

        accepted
    }
}

impl InputSink for BatchingWorker {
    fn push(&self, id: RequestId, data: EngineInputData) {
        BatchingWorker::push(self, id, data);
    }
}

impl Drop for BatchingWorker {
    fn drop(&mut self) {
        if self.state() == WorkerState::Running {
            if let Err(e) = self.stop() {
                error!("Batching worker stop failed: {}", e);
            }
        }
    }
}

/// Loop state living on the batching thread
struct BatchLoop {
    engine: Box<dyn InferenceEngine>,
    receiver: Receiver<QueueEntry>,
    events: EventSink,
    depth: Arc<AtomicUsize>,
    max_batches: usize,
    output: Vec<f32>,
}

impl BatchLoop {
    fn new(
        engine: Box<dyn InferenceEngine>,
        receiver: Receiver<QueueEntry>,
        events: EventSink,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        let max_batches = engine.max_batches();
        let output = vec![0.0; max_batches * engine.batch_output_n()];
        Self {
            engine,
            receiver,
            events,
            depth,
            max_batches,
            output,
        }
    }

    /// Process batches until the queue is closed and empty, then return the engine
    fn run(mut self) -> Box<dyn InferenceEngine> {
        debug!("Batching loop started");
        while let Some(batch) = self.next_batch() {
            self.process(batch);
        }
        debug!("Batching loop finished");
        self.engine
    }

    /// Block for the first entry, then take whatever else is queued up to
    /// `max_batches`
    fn next_batch(&self) -> Option<RequestBatch> {
        let first = self.receiver.recv().ok()?;

        let mut batch = RequestBatch::with_capacity(self.max_batches);
        batch.entries.push(first);
        while batch.len() < self.max_batches {
            match self.receiver.try_recv() {
                Ok(entry) => batch.entries.push(entry),
                Err(_) => break,
            }
        }

        let remaining = self.depth.fetch_sub(batch.len(), Ordering::SeqCst) - batch.len();
        METRICS.inference.queue_depth.set(remaining as i64);
        METRICS.inference.batch_size.observe(batch.len() as f64);

        Some(batch)
    }

    fn process(&mut self, batch: RequestBatch) {
        let size = batch.len();
        debug!("Running batch of {} requests", size);

        let outcome = METRICS.inference.batch_duration.time(|| {
            panic::catch_unwind(AssertUnwindSafe(|| self.infer_batch(&batch)))
        });

        let error = match outcome {
            Ok(Ok(scores)) => {
                for (entry, (positive, negative)) in batch.entries.iter().zip(scores) {
                    self.events.ready(entry.id, positive, negative);
                }
                trace!("Batch of {} done in {:?}", size, batch.age());
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "engine panicked".to_string(),
        };

        error!("Inference of a batch of {} requests failed: {}", size, error);
        METRICS.inference.batches_failed.inc();
        for entry in &batch.entries {
            self.events.failed(entry.id, ErrorCode::SystemFailure);
        }
    }

    /// Load every entry into its slot, infer and read back (positive, negative)
    /// per slot
    fn infer_batch(&mut self, batch: &RequestBatch) -> EngineResult<Vec<(f32, f32)>> {
        let size = batch.len();

        for (slot, entry) in batch.entries.iter().enumerate() {
            entry.data.load_into(slot, self.engine.as_mut())?;
        }

        self.engine.infer(size)?;

        let output_n = self.engine.batch_output_n();
        let n = size * output_n;
        self.engine.unload_output(size, &mut self.output[..n])?;

        let positive = self.engine.positive_index();
        let negative = self.engine.negative_index();

        self.output[..n]
            .chunks(output_n)
            .map(|slot| match (slot.get(positive), slot.get(negative)) {
                (Some(&pos), Some(&neg)) => Ok((pos, neg)),
                _ => Err(EngineError::Backend(format!(
                    "score indexes {} and {} outside output of {}",
                    positive, negative, output_n
                ))),
            })
            .collect()
    }
}
