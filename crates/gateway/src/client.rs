//! Async client for the gateway protocol

use crate::error::{GatewayError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use skinscan_proto::{ClientMessage, RequestInfo, ServerMessage, ServiceEvent};
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection to a running gateway
///
/// Outcomes that arrive while waiting for another answer are buffered and
/// returned by [`GatewayClient::next_event`].
pub struct GatewayClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    events: VecDeque<ServiceEvent>,
}

impl GatewayClient {
    /// Connect to `host:port`
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        debug!("Connected to gateway at {}", address);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            events: VecDeque::new(),
        })
    }

    /// Submit encoded image bytes
    pub async fn submit_bytes(&mut self, data: &[u8]) -> Result<RequestInfo> {
        self.send(&ClientMessage::SubmitBytes {
            data: STANDARD.encode(data),
        })
        .await?;
        self.wait_accepted().await
    }

    /// Submit the path of an image on the gateway host
    pub async fn submit_path(&mut self, path: &str) -> Result<RequestInfo> {
        self.send(&ClientMessage::SubmitPath {
            path: path.to_string(),
        })
        .await?;
        self.wait_accepted().await
    }

    /// Fetch the service metrics in Prometheus text format
    pub async fn metrics(&mut self) -> Result<String> {
        self.send(&ClientMessage::Metrics).await?;
        loop {
            match self.read_message().await? {
                ServerMessage::Metrics { text } => return Ok(text),
                other => self.unexpected(other)?,
            }
        }
    }

    /// Next outcome for any request submitted on this connection
    pub async fn next_event(&mut self) -> Result<ServiceEvent> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }

        loop {
            let message = self.read_message().await?;
            if let Some(event) = as_event(&message) {
                return Ok(event);
            }
            self.unexpected(message)?;
        }
    }

    async fn wait_accepted(&mut self) -> Result<RequestInfo> {
        loop {
            match self.read_message().await? {
                ServerMessage::Accepted(info) => return Ok(info),
                other => self.unexpected(other)?,
            }
        }
    }

    /// Buffer outcomes; anything else is an error
    fn unexpected(&mut self, message: ServerMessage) -> Result<()> {
        if let Some(event) = as_event(&message) {
            self.events.push_back(event);
            return Ok(());
        }

        match message {
            ServerMessage::Error { message } => Err(GatewayError::Server(message)),
            other => Err(GatewayError::Protocol(format!("{:?}", other))),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<ServerMessage> {
        loop {
            let line = self.lines.next_line().await?.ok_or(GatewayError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }
}

fn as_event(message: &ServerMessage) -> Option<ServiceEvent> {
    match *message {
        ServerMessage::ResultReady {
            id,
            positive,
            negative,
        } => Some(ServiceEvent::ResultReady {
            id,
            positive,
            negative,
        }),
        ServerMessage::ResultFailed { id, code } => Some(ServiceEvent::ResultFailed { id, code }),
        _ => None,
    }
}
