//! SkinScan protocol types
//!
//! Request/response contract shared by the inference pipeline and the gateway.
//! The gateway speaks these types as newline-delimited JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request identifier, assigned by the service in increasing order
pub type RequestId = u64;

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoError,
    DataEmpty,
    FileNotFound,
    DecodeFailed,
    ChannelMismatch,
    ImageTooSmall,
    ServiceStopping,
    SystemFailure,
}

impl ErrorCode {
    /// Stable name used in logs and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NoError",
            ErrorCode::DataEmpty => "DataEmpty",
            ErrorCode::FileNotFound => "FileNotFound",
            ErrorCode::DecodeFailed => "DecodeFailed",
            ErrorCode::ChannelMismatch => "ChannelMismatch",
            ErrorCode::ImageTooSmall => "ImageTooSmall",
            ErrorCode::ServiceStopping => "ServiceStopping",
            ErrorCode::SystemFailure => "SystemFailure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a submission: the assigned id and the predicted latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub id: RequestId,
    pub estimate_ms: i64,
}

/// Asynchronous outcome of a request. Exactly one is produced per accepted id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceEvent {
    ResultReady {
        id: RequestId,
        positive: f32,
        negative: f32,
    },
    ResultFailed {
        id: RequestId,
        code: ErrorCode,
    },
}

impl ServiceEvent {
    /// Request this event belongs to
    pub fn id(&self) -> RequestId {
        match self {
            ServiceEvent::ResultReady { id, .. } => *id,
            ServiceEvent::ResultFailed { id, .. } => *id,
        }
    }

    /// Check if the event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, ServiceEvent::ResultFailed { .. })
    }
}

/// Line sent by a gateway client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Encoded image, base64 in `data`
    SubmitBytes { data: String },

    /// Image on the service host's filesystem
    SubmitPath { path: String },

    /// Prometheus text exposition of the service metrics
    Metrics,
}

/// Line sent by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Accepted(RequestInfo),
    ResultReady {
        id: RequestId,
        positive: f32,
        negative: f32,
    },
    ResultFailed {
        id: RequestId,
        code: ErrorCode,
    },
    Metrics {
        text: String,
    },
    Error {
        message: String,
    },
}

impl From<ServiceEvent> for ServerMessage {
    fn from(event: ServiceEvent) -> Self {
        match event {
            ServiceEvent::ResultReady { id, positive, negative } => {
                ServerMessage::ResultReady { id, positive, negative }
            }
            ServiceEvent::ResultFailed { id, code } => ServerMessage::ResultFailed { id, code },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"submitPath","path":"/tmp/a.png"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubmitPath {
                path: "/tmp/a.png".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"metrics"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Metrics);
    }

    #[test]
    fn test_server_message_wire_format() {
        let accepted = ServerMessage::Accepted(RequestInfo { id: 3, estimate_ms: 12 });
        let json = serde_json::to_value(&accepted).unwrap();
        assert_eq!(json["type"], "accepted");
        assert_eq!(json["id"], 3);
        assert_eq!(json["estimateMs"], 12);

        let failed: ServerMessage = ServiceEvent::ResultFailed {
            id: 7,
            code: ErrorCode::DecodeFailed,
        }
        .into();
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "resultFailed");
        assert_eq!(json["code"], "DecodeFailed");
    }

    #[test]
    fn test_event_accessors() {
        let ready = ServiceEvent::ResultReady { id: 1, positive: 0.9, negative: 0.1 };
        assert_eq!(ready.id(), 1);
        assert!(!ready.is_failure());

        let failed = ServiceEvent::ResultFailed { id: 2, code: ErrorCode::SystemFailure };
        assert_eq!(failed.id(), 2);
        assert!(failed.is_failure());
        assert_eq!(ErrorCode::SystemFailure.to_string(), "SystemFailure");
    }
}
