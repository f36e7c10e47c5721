//! Newline-delimited JSON gateway over TCP
//!
//! Each connection sends [`ClientMessage`] lines and receives [`ServerMessage`]
//! lines: an `accepted` answer per submission, then the outcome of that
//! submission whenever the pipeline produces it.

use crate::error::{GatewayError, Result};
use crate::router::{ConnectionSender, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use skinscan_common::METRICS;
use skinscan_proto::{ClientMessage, RequestInfo, ServerMessage};
use skinscan_worker::Service;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Longest accepted client line, base64 payload included
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Upper bound on waiting for connections to flush drained outcomes
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-facing front of a [`Service`]
pub struct Gateway {
    service: Arc<Service>,
    router: Arc<Router>,
}

impl Gateway {
    /// Create the gateway and start forwarding service events to connections
    pub fn new(service: Arc<Service>) -> Result<Self> {
        let router = Arc::new(Router::new());
        spawn_event_bridge(&service, Arc::clone(&router))?;
        Ok(Self { service, router })
    }

    /// Routing table shared with the connections
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Accept connections until `shutdown` completes, then stop the service
    ///
    /// After shutdown no new lines are read. The service drains its queues and
    /// every connection stays open until the outcomes it is waiting for have
    /// been written, bounded by [`DRAIN_TIMEOUT`].
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!("Gateway listening on {}", local);

        let (closing_tx, closing_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let service = Arc::clone(&self.service);
                    let router = Arc::clone(&self.router);
                    let closing = closing_rx.clone();
                    connections.spawn(async move {
                        info!("Client connected: {}", peer);
                        if let Err(e) = handle_connection(stream, peer, service, router, closing).await {
                            debug!("Client {} error: {}", peer, e);
                        }
                        info!("Client disconnected: {}", peer);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("Gateway on {} shutting down", local);
                    break;
                }
            }
        }
        drop(listener);

        // Connections stop reading, so nothing new reaches the service
        let _ = closing_tx.send(true);

        let service = Arc::clone(&self.service);
        match tokio::task::spawn_blocking(move || service.stop()).await {
            Ok(result) => result?,
            Err(e) => error!("Service stop task failed: {}", e),
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Closing {} connections with {} outcomes undelivered",
                connections.len(),
                self.router.waiting_count()
            );
            connections.shutdown().await;
        }

        info!("Gateway on {} stopped", local);
        Ok(())
    }
}

/// Move events from the service channel into the router on a dedicated thread
///
/// The thread ends once the service is dropped.
fn spawn_event_bridge(service: &Service, router: Arc<Router>) -> Result<JoinHandle<()>> {
    let events = service.events();
    let handle = thread::Builder::new()
        .name("skinscan-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                router.deliver(event);
            }
            debug!("Service event stream closed");
        })?;
    Ok(handle)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<Service>,
    router: Arc<Router>,
    mut closing: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Outcomes arrive from the event bridge at any time, so writes go through
    // one task that owns the socket's write half
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = serde_json::to_string(&message)?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
        }
        writer.shutdown().await?;
        Ok::<(), GatewayError>(())
    });

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
        let bytes_read = tokio::select! {
            read = limited.read_line(&mut line) => read?,
            _ = closing.changed() => {
                debug!("Gateway closing, no more input from {}", peer);
                break;
            }
        };

        if bytes_read == 0 {
            debug!("Client {} closed its side", peer);
            break;
        }

        if bytes_read > MAX_LINE_BYTES {
            warn!("Client {} sent a line over {} bytes, closing", peer, MAX_LINE_BYTES);
            reply(&tx, error_message("line too long"));
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientMessage>(trimmed) {
            Ok(message) => handle_message(message, &service, &router, &tx),
            Err(e) => {
                warn!("Client {} sent an invalid message: {}", peer, e);
                reply(&tx, error_message(format!("invalid message: {}", e)));
            }
        }
    }

    // Pending outcomes still hold senders; the writer finishes once they are delivered
    drop(tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => {
            error!("Writer task for {} failed: {}", peer, e);
            Err(GatewayError::Closed)
        }
    }
}

fn handle_message(message: ClientMessage, service: &Service, router: &Router, tx: &ConnectionSender) {
    match message {
        ClientMessage::SubmitBytes { data } => match STANDARD.decode(data.as_bytes()) {
            Ok(bytes) => accept(service.request_bytes(bytes), router, tx),
            Err(e) => reply(tx, error_message(GatewayError::from(e).to_string())),
        },
        ClientMessage::SubmitPath { path } => accept(service.request_path(path), router, tx),
        ClientMessage::Metrics => reply(
            tx,
            ServerMessage::Metrics {
                text: METRICS.gather(),
            },
        ),
    }
}

/// Answer the submission, then wait for its outcome on the same connection
fn accept(info: RequestInfo, router: &Router, tx: &ConnectionSender) {
    reply(tx, ServerMessage::Accepted(info));
    router.claim(info.id, tx.clone());
}

fn reply(tx: &ConnectionSender, message: ServerMessage) {
    if tx.send(message).is_err() {
        debug!("Connection writer is gone");
    }
}

fn error_message(message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GatewayClient;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use skinscan_common::Settings;
    use skinscan_proto::{ErrorCode, ServiceEvent};
    use skinscan_worker::EngineRegistry;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const SETTINGS: &str = r#"{
        "service": { "url": "tcp://127.0.0.1:0", "maxPreprocessingThreads": 2 },
        "tensor": {
            "type": "synthetic",
            "maxBatches": 4,
            "positiveIndex": 0,
            "negativeIndex": 1,
            "countTestsForEstimate": 1,
            "width": 8,
            "height": 8,
            "channels": 3,
            "output": 2
        },
        "image": {
            "zoom": 1.0,
            "mean": [0.5, 0.5, 0.5],
            "std": [0.5, 0.5, 0.5],
            "countTestsForEstimate": 1
        }
    }"#;

    fn white_png() -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 255, 255])))
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    struct Running {
        service: Arc<Service>,
        address: SocketAddr,
        shutdown: oneshot::Sender<()>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start_gateway() -> Running {
        start_gateway_with(SETTINGS).await
    }

    async fn start_gateway_with(json: &str) -> Running {
        let settings = Settings::from_json_str(json).unwrap();
        let service = Arc::new(Service::build(&settings, &EngineRegistry::with_builtin()).unwrap());
        service.start().unwrap();

        let gateway = Gateway::new(Arc::clone(&service)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            gateway
                .serve(listener, async move {
                    let _ = signal.await;
                })
                .await
        });

        Running {
            service,
            address,
            shutdown,
            server,
        }
    }

    async fn stop_gateway(running: Running) {
        running.shutdown.send(()).unwrap();
        running.server.await.unwrap().unwrap();
        assert!(!running.service.is_running());
    }

    #[tokio::test]
    async fn test_submit_bytes_and_receive_result() {
        let running = start_gateway().await;
        let mut client = GatewayClient::connect(&running.address.to_string()).await.unwrap();

        let info = client.submit_bytes(&white_png()).await.unwrap();
        assert!(info.estimate_ms >= 0);

        match client.next_event().await.unwrap() {
            ServiceEvent::ResultReady { id, positive, negative } => {
                assert_eq!(id, info.id);
                assert!(positive > negative);
            }
            other => panic!("unexpected event {:?}", other),
        }

        stop_gateway(running).await;
    }

    #[tokio::test]
    async fn test_failures_are_routed() {
        let running = start_gateway().await;
        let mut client = GatewayClient::connect(&running.address.to_string()).await.unwrap();

        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.png");
        let corrupt = client.submit_bytes(b"definitely not a png").await.unwrap();
        let absent = client.submit_path(&missing.to_string_lossy()).await.unwrap();

        let mut codes = Vec::new();
        for _ in 0..2 {
            match client.next_event().await.unwrap() {
                ServiceEvent::ResultFailed { id, code } => codes.push((id, code)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        codes.sort_by_key(|(id, _)| *id);
        assert_eq!(
            codes,
            vec![
                (corrupt.id, ErrorCode::DecodeFailed),
                (absent.id, ErrorCode::FileNotFound)
            ]
        );

        stop_gateway(running).await;
    }

    #[tokio::test]
    async fn test_results_go_to_submitting_connection() {
        let running = start_gateway().await;
        let address = running.address.to_string();
        let mut first = GatewayClient::connect(&address).await.unwrap();
        let mut second = GatewayClient::connect(&address).await.unwrap();

        let first_info = first.submit_bytes(&white_png()).await.unwrap();
        let second_info = second.submit_bytes(b"broken").await.unwrap();

        assert_eq!(first.next_event().await.unwrap().id(), first_info.id);
        assert_eq!(
            second.next_event().await.unwrap(),
            ServiceEvent::ResultFailed {
                id: second_info.id,
                code: ErrorCode::DecodeFailed
            }
        );

        stop_gateway(running).await;
    }

    #[tokio::test]
    async fn test_metrics_and_bad_lines() {
        let running = start_gateway().await;

        let mut client = GatewayClient::connect(&running.address.to_string()).await.unwrap();
        let text = client.metrics().await.unwrap();
        assert!(text.contains("skinscan_requests_total"));

        let mut raw = TcpStream::connect(running.address).await.unwrap();
        raw.write_all(b"{\"type\":\"launchRockets\"}\n{\"type\":\"submitBytes\",\"data\":\"%%%\"}\n")
            .await
            .unwrap();
        raw.shutdown().await.unwrap();

        let mut response = String::new();
        raw.read_to_string(&mut response).await.unwrap();
        let messages: Vec<ServerMessage> = response
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|message| matches!(message, ServerMessage::Error { .. })));

        stop_gateway(running).await;
    }

    #[tokio::test]
    async fn test_shutdown_delivers_drained_outcomes() {
        let slow = SETTINGS
            .replace("\"maxBatches\": 4", "\"maxBatches\": 1")
            .replace("\"output\": 2", "\"output\": 2, \"inferDelayMs\": 100");
        let running = start_gateway_with(&slow).await;
        let mut client = GatewayClient::connect(&running.address.to_string()).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(client.submit_bytes(&white_png()).await.unwrap().id);
        }

        // Shut down while the engine still holds queued requests
        running.shutdown.send(()).unwrap();

        let mut delivered = Vec::new();
        for _ in 0..3 {
            match client.next_event().await.unwrap() {
                ServiceEvent::ResultReady { id, .. } => delivered.push(id),
                other => panic!("unexpected event {:?}", other),
            }
        }
        delivered.sort_unstable();
        assert_eq!(delivered, ids);
        assert!(matches!(client.next_event().await, Err(GatewayError::Closed)));

        running.server.await.unwrap().unwrap();
        assert!(!running.service.is_running());
        assert_eq!(running.service.inference_depth(), 0);
    }
}
