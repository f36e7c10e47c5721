//! Outcome channel from the pipeline stages to the client side

use crossbeam::channel::{unbounded, Receiver, Sender};
use skinscan_common::METRICS;
use skinscan_proto::{ErrorCode, RequestId, ServiceEvent};
use tracing::{debug, info, warn};

/// Sending half of the service event stream
///
/// Every request produces exactly one event through this sink.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<ServiceEvent>,
}

impl EventSink {
    /// Create a sink and the receiver clients read from
    pub fn channel() -> (Self, Receiver<ServiceEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Scores for a successfully inferred request
    pub fn ready(&self, id: RequestId, positive: f32, negative: f32) {
        info!(
            "Request {} handled successfully: positive={:.4}, negative={:.4}",
            id, positive, negative
        );
        METRICS.requests.requests_succeeded.inc();
        self.send(ServiceEvent::ResultReady {
            id,
            positive,
            negative,
        });
    }

    /// Failure outcome for a request
    pub fn failed(&self, id: RequestId, code: ErrorCode) {
        warn!("Request {} failed: {}", id, code);
        METRICS.requests.requests_failed.inc();
        self.send(ServiceEvent::ResultFailed { id, code });
    }

    /// Request refused because a stage is stopping
    pub fn rejected(&self, id: RequestId) {
        METRICS.requests.requests_rejected.inc();
        self.failed(id, ErrorCode::ServiceStopping);
    }

    fn send(&self, event: ServiceEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event receiver left, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_delivers_in_order() {
        let (sink, rx) = EventSink::channel();
        sink.ready(1, 0.9, 0.1);
        sink.failed(2, ErrorCode::DecodeFailed);
        sink.rejected(3);

        assert_eq!(
            rx.recv().unwrap(),
            ServiceEvent::ResultReady {
                id: 1,
                positive: 0.9,
                negative: 0.1
            }
        );
        assert_eq!(
            rx.recv().unwrap(),
            ServiceEvent::ResultFailed {
                id: 2,
                code: ErrorCode::DecodeFailed
            }
        );
        assert_eq!(
            rx.recv().unwrap(),
            ServiceEvent::ResultFailed {
                id: 3,
                code: ErrorCode::ServiceStopping
            }
        );
    }

    #[test]
    fn test_event_sink_without_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.ready(1, 0.5, 0.5);
    }
}
