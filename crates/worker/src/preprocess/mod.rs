//! Preprocessing worker pool
//!
//! A fixed set of threads pulls submitted payloads from a shared queue, turns
//! them into engine input and forwards the result to the batching stage.
//! Conversion failures go straight to the event stream.

pub mod convert;

pub use convert::{ConvertError, ImageConverter, ImageConvertor};

use crate::events::EventSink;
use crate::input::EngineInputData;
use crate::lifecycle::WorkerState;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use skinscan_common::metrics::LatencyTimer;
use skinscan_common::{Result, ServiceError, METRICS};
use skinscan_proto::{ErrorCode, RequestId};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Raw client submission
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded image bytes
    Bytes(Vec<u8>),

    /// Path to an image file on the service host
    Path(PathBuf),
}

/// Receives successfully converted requests
pub trait InputSink: Send + Sync {
    fn push(&self, id: RequestId, data: EngineInputData);
}

struct Job {
    id: RequestId,
    payload: Payload,
}

struct PoolInner {
    state: WorkerState,
    sender: Option<Sender<Job>>,
    receiver: Option<Receiver<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// Bounded-concurrency preprocessing stage
pub struct PreprocessingPool {
    converter: Arc<dyn ImageConverter>,
    sink: Arc<dyn InputSink>,
    events: EventSink,
    threads: usize,
    depth: Arc<AtomicUsize>,
    inner: Mutex<PoolInner>,
}

impl PreprocessingPool {
    /// Create a stopped pool; submissions made before `start` are queued
    pub fn new(
        converter: Arc<dyn ImageConverter>,
        sink: Arc<dyn InputSink>,
        events: EventSink,
        threads: usize,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            converter,
            sink,
            events,
            threads: threads.max(1),
            depth: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(PoolInner {
                state: WorkerState::Stopped,
                sender: Some(sender),
                receiver: Some(receiver),
                workers: Vec::new(),
            }),
        }
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// Jobs submitted and not yet finished
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Spawn the worker threads
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != WorkerState::Stopped {
            warn!("Preprocessing pool start ignored, pool is {}", inner.state);
            return Ok(());
        }
        inner.state = WorkerState::Starting;

        if inner.sender.is_none() {
            let (sender, receiver) = unbounded();
            inner.sender = Some(sender);
            inner.receiver = Some(receiver);
        }

        let receiver = match inner.receiver.clone() {
            Some(receiver) => receiver,
            None => {
                inner.state = WorkerState::Stopped;
                return Err(ServiceError::internal("Preprocessing queue receiver missing"));
            }
        };

        for index in 0..self.threads {
            let worker = PoolWorker {
                receiver: receiver.clone(),
                converter: Arc::clone(&self.converter),
                sink: Arc::clone(&self.sink),
                events: self.events.clone(),
                depth: Arc::clone(&self.depth),
            };

            let spawned = thread::Builder::new()
                .name(format!("skinscan-preprocess-{}", index))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => inner.workers.push(handle),
                Err(e) => {
                    error!("Failed to spawn preprocessing thread: {}", e);
                    inner.state = WorkerState::Running;
                    drop(inner);
                    self.stop();
                    return Err(ServiceError::internal(format!(
                        "Failed to spawn preprocessing thread: {}",
                        e
                    )));
                }
            }
        }

        inner.state = WorkerState::Running;
        info!("Preprocessing pool started with {} threads", self.threads);
        Ok(())
    }

    /// Refuse new jobs, finish every queued one and join the threads
    pub fn stop(&self) {
        let workers = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Running {
                warn!("Preprocessing pool stop ignored, pool is {}", inner.state);
                return;
            }
            inner.state = WorkerState::Stopping;
            inner.sender = None;
            inner.receiver = None;
            std::mem::take(&mut inner.workers)
        };

        info!(
            "Stopping preprocessing pool, {} jobs left to drain",
            self.queue_depth()
        );

        for handle in workers {
            if handle.join().is_err() {
                error!("Preprocessing thread panicked");
            }
        }

        self.inner.lock().state = WorkerState::Stopped;
        info!("Preprocessing pool stopped");
    }

    /// Queue a payload; returns false (after emitting `ServiceStopping`) if
    /// the pool is stopping
    pub fn submit(&self, id: RequestId, payload: Payload) -> bool {
        let inner = self.inner.lock();

        let sender = match (&inner.state, &inner.sender) {
            (WorkerState::Stopping, _) | (_, None) => None,
            (_, Some(sender)) => Some(sender),
        };

        let accepted = match sender {
            Some(sender) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                if sender.send(Job { id, payload }).is_ok() {
                    true
                } else {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
            None => false,
        };
        drop(inner);

        METRICS
            .preprocessing
            .queue_depth
            .set(self.queue_depth() as i64);

        if !accepted {
            warn!("Request {} rejected, preprocessing is stopping", id);
            self.events.rejected(id);
        }

        accepted
    }
}

impl Drop for PreprocessingPool {
    fn drop(&mut self) {
        if self.state() == WorkerState::Running {
            self.stop();
        }
    }
}

/// State owned by one preprocessing thread
struct PoolWorker {
    receiver: Receiver<Job>,
    converter: Arc<dyn ImageConverter>,
    sink: Arc<dyn InputSink>,
    events: EventSink,
    depth: Arc<AtomicUsize>,
}

impl PoolWorker {
    fn run(self) {
        debug!("Preprocessing thread started");
        for job in self.receiver.iter() {
            self.process(job);
        }
        debug!("Preprocessing thread finished");
    }

    fn process(&self, job: Job) {
        let converted = METRICS.preprocessing.duration.time(|| {
            panic::catch_unwind(AssertUnwindSafe(|| self.converter.convert(&job.payload)))
        });

        match converted {
            Ok(Ok(data)) => {
                debug!("Request {} preprocessed", job.id);
                self.sink.push(job.id, data);
            }
            Ok(Err(e)) => {
                self.events.failed(job.id, e.code());
            }
            Err(_) => {
                error!("Image converter panicked on request {}", job.id);
                self.events.failed(job.id, ErrorCode::SystemFailure);
            }
        }

        let remaining = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        METRICS.preprocessing.queue_depth.set(remaining as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::RecvTimeoutError;
    use skinscan_proto::ServiceEvent;
    use std::time::Duration;

    /// Fails requests whose payload starts with `0xFF`, sleeps a little otherwise
    struct StubConverter;

    impl ImageConverter for StubConverter {
        fn convert(&self, payload: &Payload) -> std::result::Result<EngineInputData, ConvertError> {
            match payload {
                Payload::Bytes(data) if data.first() == Some(&0xFF) => {
                    Err(ConvertError::DecodeFailed("stub".to_string()))
                }
                Payload::Bytes(data) => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(EngineInputData::new(vec![data.iter().map(|&b| b as f32).collect()]))
                }
                Payload::Path(path) => Err(ConvertError::FileNotFound(path.clone())),
            }
        }
    }

    struct ChannelSink(Sender<(RequestId, EngineInputData)>);

    impl InputSink for ChannelSink {
        fn push(&self, id: RequestId, data: EngineInputData) {
            self.0.send((id, data)).unwrap();
        }
    }

    fn pool(threads: usize) -> (PreprocessingPool, Receiver<(RequestId, EngineInputData)>, Receiver<ServiceEvent>) {
        let (sink_tx, sink_rx) = unbounded();
        let (events, events_rx) = EventSink::channel();
        let pool = PreprocessingPool::new(
            Arc::new(StubConverter),
            Arc::new(ChannelSink(sink_tx)),
            events,
            threads,
        );
        (pool, sink_rx, events_rx)
    }

    #[test]
    fn test_pool_converts_and_reports_failures() {
        let (pool, sink_rx, events_rx) = pool(3);
        pool.start().unwrap();

        for id in 1..=10u64 {
            let payload = if id == 7 {
                Payload::Bytes(vec![0xFF])
            } else {
                Payload::Bytes(vec![id as u8])
            };
            assert!(pool.submit(id, payload));
        }
        pool.stop();

        let mut converted: Vec<RequestId> = sink_rx.try_iter().map(|(id, _)| id).collect();
        converted.sort_unstable();
        assert_eq!(converted, vec![1, 2, 3, 4, 5, 6, 8, 9, 10]);

        let events: Vec<ServiceEvent> = events_rx.try_iter().collect();
        assert_eq!(
            events,
            vec![ServiceEvent::ResultFailed {
                id: 7,
                code: ErrorCode::DecodeFailed
            }]
        );
        assert_eq!(pool.queue_depth(), 0);
    }

    #[test]
    fn test_pool_queues_before_start() {
        let (pool, sink_rx, _events_rx) = pool(1);
        assert!(pool.submit(1, Payload::Bytes(vec![1])));
        assert_eq!(pool.queue_depth(), 1);
        assert_eq!(
            sink_rx.recv_timeout(Duration::from_millis(50)).unwrap_err(),
            RecvTimeoutError::Timeout
        );

        pool.start().unwrap();
        let (id, data) = sink_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 1);
        assert_eq!(data.planes()[0], vec![1.0]);
        pool.stop();
    }

    #[test]
    fn test_pool_rejects_after_stop() {
        let (pool, sink_rx, events_rx) = pool(2);
        pool.start().unwrap();
        pool.stop();
        assert_eq!(pool.state(), WorkerState::Stopped);

        assert!(!pool.submit(4, Payload::Bytes(vec![4])));
        assert_eq!(
            events_rx.try_recv().unwrap(),
            ServiceEvent::ResultFailed {
                id: 4,
                code: ErrorCode::ServiceStopping
            }
        );
        assert!(sink_rx.try_recv().is_err());
        assert_eq!(pool.queue_depth(), 0);
    }

    #[test]
    fn test_pool_rejects_while_stopping() {
        let (pool, sink_rx, events_rx) = pool(1);
        let pool = Arc::new(pool);
        for id in 1..=40u64 {
            assert!(pool.submit(id, Payload::Bytes(vec![1])));
        }
        pool.start().unwrap();

        let stopping = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.stop())
        };

        // One thread needs about 200 ms for the backlog
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.state(), WorkerState::Stopping);
        assert!(!pool.submit(99, Payload::Bytes(vec![1])));
        assert_eq!(
            events_rx.try_recv().unwrap(),
            ServiceEvent::ResultFailed {
                id: 99,
                code: ErrorCode::ServiceStopping
            }
        );

        stopping.join().unwrap();
        assert_eq!(pool.state(), WorkerState::Stopped);
        assert_eq!(sink_rx.try_iter().count(), 40);
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn test_pool_restart() {
        let (pool, sink_rx, _events_rx) = pool(2);
        pool.start().unwrap();
        pool.start().unwrap();
        pool.stop();
        pool.stop();

        pool.start().unwrap();
        assert_eq!(pool.state(), WorkerState::Running);
        assert!(pool.submit(9, Payload::Bytes(vec![9])));
        pool.stop();
        assert_eq!(sink_rx.try_recv().unwrap().0, 9);
    }

    #[test]
    fn test_pool_path_failure_code() {
        let (pool, _sink_rx, events_rx) = pool(1);
        pool.start().unwrap();
        pool.submit(2, Payload::Path(PathBuf::from("/missing.png")));
        pool.stop();

        let event = events_rx.try_recv().unwrap();
        assert_eq!(
            event,
            ServiceEvent::ResultFailed {
                id: 2,
                code: ErrorCode::FileNotFound
            }
        );
    }
}
