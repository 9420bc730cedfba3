//! RecoveryController: error classification, backoff, retry scheduling
//!
//! Converts a raised error into `retry(delay)` or `fail(final)` with an
//! auditable history per file. Scheduled retries fire as `RetryCommand`
//! messages on an mpsc channel; a supervisor loop owned by the application
//! routes them back into the session manager or pipeline, which keeps this
//! component free of direct dependencies on either.

use crate::bus::ProgressSink;
use crate::config::RetryConfig;
use crate::error::Error;
use crate::events::{ErrorRecord, UploadEvent};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error classification tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Network,
    Size,
    Format,
    Permission,
    Storage,
    Auth,
    Unknown,
}

impl ErrorClass {
    /// Case-insensitive substring classification of an error message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let matches = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if matches(&["network", "timeout", "connection"]) {
            ErrorClass::Network
        } else if matches(&["size", "limit"]) {
            ErrorClass::Size
        } else if matches(&["format", "type", "unsupported"]) {
            ErrorClass::Format
        } else if matches(&["permission", "access"]) {
            ErrorClass::Permission
        } else if matches(&["storage", "disk", "io"]) {
            ErrorClass::Storage
        } else if matches(&["authentication", "auth"]) {
            ErrorClass::Auth
        } else {
            ErrorClass::Unknown
        }
    }

    /// Classification augmented by the explicit error kind when available;
    /// falls back to message matching for opaque kinds.
    pub fn classify_error(error: &Error) -> Self {
        match error {
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorClass::Permission,
                std::io::ErrorKind::TimedOut => ErrorClass::Network,
                _ => ErrorClass::Storage,
            },
            Error::Timeout(_) => ErrorClass::Network,
            Error::SizeExceeded { .. } | Error::SizeMismatch { .. } => ErrorClass::Size,
            Error::Unauthorized(_) => ErrorClass::Auth,
            Error::ChecksumMismatch { .. } => ErrorClass::Format,
            _ => Self::classify(&error.to_string()),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Network | ErrorClass::Size | ErrorClass::Storage | ErrorClass::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Size => "size",
            ErrorClass::Format => "format",
            ErrorClass::Permission => "permission",
            ErrorClass::Storage => "storage",
            ErrorClass::Auth => "auth",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `handle`, also serialized into HTTP error bodies
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RecoveryAction {
    #[serde(rename_all = "camelCase")]
    Retry { delay_ms: u64, attempt: u32 },
    #[serde(rename_all = "camelCase")]
    Fail { kind: ErrorClass },
}

/// Where the failed operation sits, so the retry callback can be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryContext {
    ChunkUpload,
    Assembly,
    Stage(String),
}

impl RetryContext {
    pub fn as_str(&self) -> &str {
        match self {
            RetryContext::ChunkUpload => "chunk_upload",
            RetryContext::Assembly => "assembly",
            RetryContext::Stage(name) => name,
        }
    }
}

/// A scheduled retry firing; consumed by the supervisor loop
#[derive(Debug, Clone)]
pub struct RetryCommand {
    pub file_id: String,
    pub context: RetryContext,
    pub attempt: u32,
}

struct RetryRecord {
    attempts: u32,
    first_error_at: DateTime<Utc>,
    last_error_at: DateTime<Utc>,
    history: Vec<ErrorRecord>,
    terminal: bool,
    last_action: Option<RecoveryAction>,
}

/// Backoff computation for the retry policy
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Non-jittered delay for an attempt (1-based):
    /// `min(max_delay, base_delay * 2^(attempt-1))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .config
            .base_delay
            .saturating_mul(1u32 << exponent);
        scaled.min(self.config.max_delay)
    }

    /// Backoff with jitter in `[0, 0.1 * delay)`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let jitter_ms = (base.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        base + Duration::from_millis(jitter_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

pub struct RecoveryController {
    policy: RetryPolicy,
    records: Mutex<HashMap<String, RetryRecord>>,
    cmd_tx: mpsc::Sender<RetryCommand>,
    bus: Arc<dyn ProgressSink>,
    shutdown: CancellationToken,
}

impl RecoveryController {
    /// Build the controller and the receiving end of its retry channel.
    pub fn new(
        config: RetryConfig,
        bus: Arc<dyn ProgressSink>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<RetryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        (
            Self {
                policy: RetryPolicy::new(config),
                records: Mutex::new(HashMap::new()),
                cmd_tx,
                bus,
                shutdown,
            },
            cmd_rx,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify an error and decide the outcome for `file_id`.
    ///
    /// On `Retry` a timer is scheduled that fires a `RetryCommand`; on
    /// `Fail` the record turns terminal and the terminal `upload_error`
    /// event (with full history) is emitted. The caller owns the session /
    /// pipeline state transition that follows a `Fail`.
    pub async fn handle(
        &self,
        file_id: &str,
        owner_id: &str,
        error: &Error,
        context: RetryContext,
    ) -> RecoveryAction {
        let class = ErrorClass::classify_error(error);
        let message = error.to_string();
        let now = Utc::now();

        let mut records = self.records.lock().await;
        let record = records.entry(file_id.to_string()).or_insert(RetryRecord {
            attempts: 0,
            first_error_at: now,
            last_error_at: now,
            history: Vec::new(),
            terminal: false,
            last_action: None,
        });

        // Once terminal, no further actions for this file until a new
        // session resets the record.
        if record.terminal {
            return RecoveryAction::Fail { kind: class };
        }

        record.attempts += 1;
        record.last_error_at = now;
        record.history.push(ErrorRecord {
            kind: class.as_str().to_string(),
            message: message.clone(),
            timestamp: now,
            context: context.as_str().to_string(),
        });

        if !class.retryable() || record.attempts > self.policy.max_attempts() {
            record.terminal = true;
            let action = RecoveryAction::Fail { kind: class };
            record.last_action = Some(action.clone());
            warn!(
                file_id = %file_id,
                class = %class,
                attempts = record.attempts,
                first_error_at = %record.first_error_at,
                error = %message,
                "permanent failure"
            );
            self.bus.error_session(
                file_id,
                owner_id,
                class.as_str(),
                &message,
                false,
                Some(record.history.clone()),
            );
            return action;
        }

        let attempt = record.attempts;
        let delay = self.policy.delay_with_jitter(attempt);
        let action = RecoveryAction::Retry {
            delay_ms: delay.as_millis() as u64,
            attempt,
        };
        record.last_action = Some(action.clone());
        drop(records);

        info!(
            file_id = %file_id,
            class = %class,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "scheduling retry"
        );
        self.bus
            .error_session(file_id, owner_id, class.as_str(), &message, true, None);
        self.bus.publish(UploadEvent::UploadRetry {
            file_id: file_id.to_string(),
            principal_id: owner_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            timestamp: now,
        });
        self.schedule(file_id.to_string(), context, attempt, delay);
        action
    }

    /// Durable success signal: completion clears the retry record so a
    /// later session for the same id starts with a fresh budget.
    pub async fn mark_retry_succeeded(&self, file_id: &str) {
        if self.records.lock().await.remove(file_id).is_some() {
            debug!(file_id = %file_id, "retry record cleared after success");
        }
    }

    /// Drop any record for a file (new session reset).
    pub async fn reset(&self, file_id: &str) {
        self.records.lock().await.remove(file_id);
    }

    /// Last decision made for a file, if any.
    pub async fn advice(&self, file_id: &str) -> Option<RecoveryAction> {
        self.records
            .lock()
            .await
            .get(file_id)
            .and_then(|r| r.last_action.clone())
    }

    /// Recovery history for diagnostics and terminal summaries.
    pub async fn history(&self, file_id: &str) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .await
            .get(file_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Evict terminal records older than `ttl`.
    pub async fn sweep(&self, ttl: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.records
            .lock()
            .await
            .retain(|_, record| !(record.terminal && record.last_error_at < cutoff));
    }

    fn schedule(&self, file_id: String, context: RetryContext, attempt: u32, delay: Duration) {
        let tx = self.cmd_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(file_id = %file_id, "retry timer cancelled by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = tx
                        .send(RetryCommand {
                            file_id,
                            context,
                            attempt,
                        })
                        .await;
                }
            }
        });
    }
}
