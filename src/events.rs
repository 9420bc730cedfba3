//! Progress event types for the upload push channel
//!
//! Events are published on the ProgressBus and serialized as JSON for
//! WebSocket delivery. The `type` tag uses the wire names the clients
//! subscribe on (`upload_started`, `upload_progress`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a file's recovery history, carried on terminal errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Classification tag (`network`, `storage`, `permission`, ...)
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Where the error surfaced (`chunk_upload`, `assembly`, stage name)
    pub context: String,
}

/// Upload progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// Session created; emitted once per `init`
    #[serde(rename_all = "camelCase")]
    UploadStarted {
        file_id: String,
        principal_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        timestamp: DateTime<Utc>,
    },

    /// Chunk received or pipeline stage advanced
    #[serde(rename_all = "camelCase")]
    UploadProgress {
        file_id: String,
        principal_id: String,
        /// Aggregate progress in [0,1], monotonically non-decreasing
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        received_chunks: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
        /// Pipeline stage driving this update, when applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// File assembled and all pipeline stages finished
    #[serde(rename_all = "camelCase")]
    UploadCompleted {
        file_id: String,
        principal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Upload or pipeline error; terminal when `retryable` is false
    #[serde(rename_all = "camelCase")]
    UploadError {
        file_id: String,
        principal_id: String,
        kind: String,
        message: String,
        retryable: bool,
        /// Full recovery history, present on terminal failures
        #[serde(skip_serializing_if = "Option::is_none")]
        error_history: Option<Vec<ErrorRecord>>,
        timestamp: DateTime<Utc>,
    },

    /// A retry has been scheduled for the file
    #[serde(rename_all = "camelCase")]
    UploadRetry {
        file_id: String,
        principal_id: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Reply to a client `{"type":"ping"}` frame
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: DateTime<Utc> },
}

impl UploadEvent {
    /// Event type as the wire tag string
    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::UploadStarted { .. } => "upload_started",
            UploadEvent::UploadProgress { .. } => "upload_progress",
            UploadEvent::UploadCompleted { .. } => "upload_completed",
            UploadEvent::UploadError { .. } => "upload_error",
            UploadEvent::UploadRetry { .. } => "upload_retry",
            UploadEvent::Pong { .. } => "pong",
        }
    }

    /// File the event belongs to; `None` for connection-level frames
    pub fn file_id(&self) -> Option<&str> {
        match self {
            UploadEvent::UploadStarted { file_id, .. }
            | UploadEvent::UploadProgress { file_id, .. }
            | UploadEvent::UploadCompleted { file_id, .. }
            | UploadEvent::UploadError { file_id, .. }
            | UploadEvent::UploadRetry { file_id, .. } => Some(file_id),
            UploadEvent::Pong { .. } => None,
        }
    }

    /// Owning principal; fan-out delivers only to matching subscribers
    pub fn principal_id(&self) -> Option<&str> {
        match self {
            UploadEvent::UploadStarted { principal_id, .. }
            | UploadEvent::UploadProgress { principal_id, .. }
            | UploadEvent::UploadCompleted { principal_id, .. }
            | UploadEvent::UploadError { principal_id, .. }
            | UploadEvent::UploadRetry { principal_id, .. } => Some(principal_id),
            UploadEvent::Pong { .. } => None,
        }
    }

    /// Terminal events end a session's stream and are never dropped by
    /// subscriber queues.
    pub fn is_terminal(&self) -> bool {
        match self {
            UploadEvent::UploadCompleted { .. } => true,
            UploadEvent::UploadError { retryable, .. } => !retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_are_snake_case() {
        let event = UploadEvent::UploadStarted {
            file_id: "f1".into(),
            principal_id: "u1".into(),
            file_name: "a.bin".into(),
            file_size: 42,
            total_chunks: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"upload_started""#));
        assert!(json.contains(r#""fileId":"f1""#));
        assert!(json.contains(r#""totalChunks":1"#));
    }

    #[test]
    fn pong_roundtrip() {
        let json = serde_json::to_string(&UploadEvent::Pong {
            timestamp: Utc::now(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"pong""#));
        let parsed: UploadEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "pong");
    }

    #[test]
    fn terminal_classification() {
        let completed = UploadEvent::UploadCompleted {
            file_id: "f".into(),
            principal_id: "u".into(),
            file_path: None,
            size: None,
            duration_ms: 10,
            timestamp: Utc::now(),
        };
        assert!(completed.is_terminal());

        let retryable = UploadEvent::UploadError {
            file_id: "f".into(),
            principal_id: "u".into(),
            kind: "storage".into(),
            message: "disk".into(),
            retryable: true,
            error_history: None,
            timestamp: Utc::now(),
        };
        assert!(!retryable.is_terminal());

        let fatal = UploadEvent::UploadError {
            file_id: "f".into(),
            principal_id: "u".into(),
            kind: "permission".into(),
            message: "denied".into(),
            retryable: false,
            error_history: None,
            timestamp: Utc::now(),
        };
        assert!(fatal.is_terminal());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = UploadEvent::UploadProgress {
            file_id: "f".into(),
            principal_id: "u".into(),
            progress: 0.5,
            received_chunks: None,
            total_chunks: None,
            stage: Some("ocr".into()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("receivedChunks"));
        assert!(json.contains(r#""stage":"ocr""#));
    }
}
