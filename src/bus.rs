//! ProgressBus: per-principal fan-out of upload events
//!
//! Producers publish events; each event is delivered only to subscribers
//! whose principal matches the event's owner. Every subscriber owns a
//! bounded queue: on overflow the oldest non-terminal progress event is
//! dropped, terminal events never are. A dead subscriber (closed queue)
//! is removed on the next publish and never fails the producer.
//!
//! The bus also retains a per-file `SessionInfo` record so late callers
//! can observe the last state for a grace period after terminal.

use crate::events::UploadEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long terminal session info stays observable
const TERMINAL_GRACE: Duration = Duration::from_secs(30);
/// Absolute session info lifetime
const SESSION_INFO_TTL: Duration = Duration::from_secs(24 * 3600);
/// Per-subscriber queue capacity
const SUBSCRIBER_CAPACITY: usize = 256;

/// Event sink consumed by the session manager, pipeline and recovery
/// components. Keeping this as a trait breaks the dependency cycle between
/// producers and the concrete bus, and lets tests inject recording sinks.
///
/// The provided helpers build the corresponding events; the bus derives
/// its retained `SessionInfo` from whatever flows through `publish`.
pub trait ProgressSink: Send + Sync {
    /// Best-effort delivery; send failures never propagate to the producer.
    fn publish(&self, event: UploadEvent);

    /// Read-through accessor for the retained per-file state.
    fn session_status(&self, file_id: &str) -> Option<SessionInfo>;

    fn start_session(
        &self,
        file_id: &str,
        principal_id: &str,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
    ) {
        self.publish(UploadEvent::UploadStarted {
            file_id: file_id.to_string(),
            principal_id: principal_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            total_chunks,
            timestamp: Utc::now(),
        });
    }

    fn update_progress(
        &self,
        file_id: &str,
        principal_id: &str,
        progress: f64,
        chunks: Option<(u32, u32)>,
        stage: Option<&str>,
    ) {
        self.publish(UploadEvent::UploadProgress {
            file_id: file_id.to_string(),
            principal_id: principal_id.to_string(),
            progress,
            received_chunks: chunks.map(|(received, _)| received),
            total_chunks: chunks.map(|(_, total)| total),
            stage: stage.map(|s| s.to_string()),
            timestamp: Utc::now(),
        });
    }

    fn complete_session(
        &self,
        file_id: &str,
        principal_id: &str,
        file_path: Option<String>,
        size: Option<u64>,
        duration_ms: u64,
    ) {
        self.publish(UploadEvent::UploadCompleted {
            file_id: file_id.to_string(),
            principal_id: principal_id.to_string(),
            file_path,
            size,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    fn error_session(
        &self,
        file_id: &str,
        principal_id: &str,
        kind: &str,
        message: &str,
        retryable: bool,
        error_history: Option<Vec<crate::events::ErrorRecord>>,
    ) {
        self.publish(UploadEvent::UploadError {
            file_id: file_id.to_string(),
            principal_id: principal_id.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
            retryable,
            error_history,
            timestamp: Utc::now(),
        });
    }
}

/// Last observed state for one file, retained past terminal for late readers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub file_id: String,
    pub principal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Wire status: `receiving`, `completed`, `error`
    pub status: String,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    terminal_at: Option<Instant>,
}

/// Bounded event queue owned by one subscriber.
///
/// Writers push synchronously; the WebSocket write task drains with
/// `recv().await`. Closing wakes the reader and makes further pushes no-ops.
pub struct SubscriberQueue {
    events: Mutex<VecDeque<UploadEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an event, applying the overflow policy.
    ///
    /// Returns false if the queue is closed (dead sink).
    pub fn push(&self, event: UploadEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() >= self.capacity {
            // Evict the oldest droppable progress event; terminal events
            // and the overflow of non-progress traffic are always kept.
            let droppable = events
                .iter()
                .position(|e| matches!(e, UploadEvent::UploadProgress { .. }));
            match droppable {
                Some(idx) => {
                    events.remove(idx);
                }
                None if matches!(event, UploadEvent::UploadProgress { .. }) => {
                    // Nothing droppable and the newcomer is itself droppable
                    return true;
                }
                None => {}
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        true
    }

    /// Await the next event; `None` once closed and drained.
    pub async fn recv(&self) -> Option<UploadEvent> {
        loop {
            {
                let mut events = match self.events.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.events.lock().map(|q| q.len()).unwrap_or(0)
    }
}

struct SubscriberEntry {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
}

/// Handle returned by `subscribe`; used to drain events and to unsubscribe.
pub struct SubscriberHandle {
    pub id: Uuid,
    pub principal_id: String,
    pub queue: Arc<SubscriberQueue>,
}

/// In-memory progress bus with per-principal subscriber fan-out
pub struct ProgressBus {
    subscribers: RwLock<HashMap<String, Vec<SubscriberEntry>>>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber for a principal's events.
    pub fn subscribe(&self, principal_id: &str) -> SubscriberHandle {
        let entry = SubscriberEntry {
            id: Uuid::new_v4(),
            queue: Arc::new(SubscriberQueue::new(SUBSCRIBER_CAPACITY)),
        };
        let handle = SubscriberHandle {
            id: entry.id,
            principal_id: principal_id.to_string(),
            queue: Arc::clone(&entry.queue),
        };
        let mut subscribers = self.write_subscribers();
        subscribers
            .entry(principal_id.to_string())
            .or_default()
            .push(entry);
        debug!(principal = %principal_id, subscriber = %handle.id, "subscriber registered");
        handle
    }

    /// Idempotent removal of a subscriber.
    pub fn unsubscribe(&self, handle: &SubscriberHandle) {
        handle.queue.close();
        let mut subscribers = self.write_subscribers();
        if let Some(entries) = subscribers.get_mut(&handle.principal_id) {
            entries.retain(|e| e.id != handle.id);
            if entries.is_empty() {
                subscribers.remove(&handle.principal_id);
            }
        }
    }

    /// Number of live subscribers for a principal.
    pub fn subscriber_count(&self, principal_id: &str) -> usize {
        self.read_subscribers()
            .get(principal_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Evict terminal session records past the grace period and anything
    /// older than the absolute TTL. Called by the background sweeper.
    pub fn sweep(&self) {
        let now = Instant::now();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(SESSION_INFO_TTL)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut sessions = self.write_sessions();
        sessions.retain(|_, info| {
            let terminal_expired = info
                .terminal_at
                .map(|t| now.duration_since(t) >= TERMINAL_GRACE)
                .unwrap_or(false);
            !terminal_expired && info.started_at > cutoff
        });
    }

    fn deliver(&self, event: &UploadEvent) {
        let Some(principal_id) = event.principal_id() else {
            return;
        };
        let mut dead: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.read_subscribers();
            if let Some(entries) = subscribers.get(principal_id) {
                for entry in entries {
                    if !entry.queue.push(event.clone()) {
                        dead.push(entry.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            warn!(principal = %principal_id, dropped = dead.len(), "removing dead subscribers");
            let mut subscribers = self.write_subscribers();
            if let Some(entries) = subscribers.get_mut(principal_id) {
                entries.retain(|e| !dead.contains(&e.id));
                if entries.is_empty() {
                    subscribers.remove(principal_id);
                }
            }
        }
    }

    fn record(&self, event: &UploadEvent) {
        let now = Utc::now();
        let mut sessions = self.write_sessions();
        match event {
            UploadEvent::UploadStarted {
                file_id,
                principal_id,
                file_name,
                file_size,
                ..
            } => {
                sessions.insert(
                    file_id.clone(),
                    SessionInfo {
                        file_id: file_id.clone(),
                        principal_id: principal_id.clone(),
                        file_name: Some(file_name.clone()),
                        file_size: Some(*file_size),
                        status: "receiving".to_string(),
                        progress: 0.0,
                        error: None,
                        started_at: now,
                        updated_at: now,
                        terminal_at: None,
                    },
                );
            }
            UploadEvent::UploadProgress {
                file_id, progress, ..
            } => {
                if let Some(info) = sessions.get_mut(file_id) {
                    // Monotonic even if a late stage update arrives out of order
                    info.progress = info.progress.max(*progress);
                    info.updated_at = now;
                }
            }
            UploadEvent::UploadCompleted { file_id, .. } => {
                if let Some(info) = sessions.get_mut(file_id) {
                    info.status = "completed".to_string();
                    info.progress = 1.0;
                    info.updated_at = now;
                    info.terminal_at = Some(Instant::now());
                }
            }
            UploadEvent::UploadError {
                file_id,
                message,
                retryable,
                ..
            } => {
                if let Some(info) = sessions.get_mut(file_id) {
                    info.error = Some(message.clone());
                    info.updated_at = now;
                    if !retryable {
                        info.status = "error".to_string();
                        info.terminal_at = Some(Instant::now());
                    }
                }
            }
            UploadEvent::UploadRetry { .. } | UploadEvent::Pong { .. } => {}
        }
    }

    fn read_subscribers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<SubscriberEntry>>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_subscribers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<SubscriberEntry>>> {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionInfo>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressSink for ProgressBus {
    fn publish(&self, event: UploadEvent) {
        self.record(&event);
        self.deliver(&event);
    }

    fn session_status(&self, file_id: &str) -> Option<SessionInfo> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let info = sessions.get(file_id)?;
        // Read-through eviction: terminal records stay observable for the
        // grace period only.
        if let Some(terminal) = info.terminal_at {
            if terminal.elapsed() >= TERMINAL_GRACE {
                return None;
            }
        }
        Some(info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(file_id: &str, principal: &str, p: f64) -> UploadEvent {
        UploadEvent::UploadProgress {
            file_id: file_id.into(),
            principal_id: principal.into(),
            progress: p,
            received_chunks: None,
            total_chunks: None,
            stage: None,
            timestamp: Utc::now(),
        }
    }

    fn started(file_id: &str, principal: &str) -> UploadEvent {
        UploadEvent::UploadStarted {
            file_id: file_id.into(),
            principal_id: principal.into(),
            file_name: "f.bin".into(),
            file_size: 10,
            total_chunks: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fan_out_is_isolated_by_principal() {
        let bus = ProgressBus::new();
        let sub_a = bus.subscribe("alice");
        let sub_b = bus.subscribe("bob");

        bus.publish(started("f3", "alice"));
        bus.publish(progress("f3", "alice", 0.5));

        assert_eq!(
            sub_a.queue.recv().await.unwrap().event_type(),
            "upload_started"
        );
        assert_eq!(
            sub_a.queue.recv().await.unwrap().event_type(),
            "upload_progress"
        );
        // Bob's queue stays empty
        assert_eq!(sub_b.queue.len(), 0);
    }

    #[tokio::test]
    async fn events_for_same_file_arrive_in_publish_order() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe("alice");

        bus.publish(started("f1", "alice"));
        for i in 1..=5 {
            bus.publish(progress("f1", "alice", i as f64 / 5.0));
        }

        let mut last = -1.0;
        sub.queue.recv().await.unwrap();
        for _ in 0..5 {
            match sub.queue.recv().await.unwrap() {
                UploadEvent::UploadProgress { progress, .. } => {
                    assert!(progress > last);
                    last = progress;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn overflow_drops_oldest_progress_never_terminal() {
        let queue = SubscriberQueue::new(3);
        assert!(queue.push(progress("f", "u", 0.1)));
        assert!(queue.push(progress("f", "u", 0.2)));
        let completed = UploadEvent::UploadCompleted {
            file_id: "f".into(),
            principal_id: "u".into(),
            file_path: None,
            size: None,
            duration_ms: 1,
            timestamp: Utc::now(),
        };
        assert!(queue.push(completed));
        // Full: the oldest progress (0.1) is evicted to admit the newcomer
        assert!(queue.push(progress("f", "u", 0.3)));
        assert_eq!(queue.len(), 3);

        // Fill with terminals only, then push progress: newcomer is dropped
        let queue = SubscriberQueue::new(1);
        let fatal = UploadEvent::UploadError {
            file_id: "f".into(),
            principal_id: "u".into(),
            kind: "permission".into(),
            message: "denied".into(),
            retryable: false,
            error_history: None,
            timestamp: Utc::now(),
        };
        assert!(queue.push(fatal.clone()));
        assert!(queue.push(progress("f", "u", 0.9)));
        assert_eq!(queue.len(), 1);
        // Another terminal is admitted even past capacity
        assert!(queue.push(fatal));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn dead_sink_is_removed_on_publish() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe("alice");
        assert_eq!(bus.subscriber_count("alice"), 1);

        sub.queue.close();
        bus.publish(started("f1", "alice"));
        assert_eq!(bus.subscriber_count("alice"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe("alice");
        bus.unsubscribe(&sub);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count("alice"), 0);
    }

    #[tokio::test]
    async fn session_info_tracks_lifecycle() {
        let bus = ProgressBus::new();
        bus.publish(started("f1", "alice"));
        let info = bus.session_status("f1").unwrap();
        assert_eq!(info.status, "receiving");
        assert_eq!(info.progress, 0.0);

        bus.publish(progress("f1", "alice", 0.4));
        assert_eq!(bus.session_status("f1").unwrap().progress, 0.4);

        // Progress never regresses
        bus.publish(progress("f1", "alice", 0.2));
        assert_eq!(bus.session_status("f1").unwrap().progress, 0.4);

        bus.publish(UploadEvent::UploadCompleted {
            file_id: "f1".into(),
            principal_id: "alice".into(),
            file_path: Some("/out/f1".into()),
            size: Some(10),
            duration_ms: 12,
            timestamp: Utc::now(),
        });
        let info = bus.session_status("f1").unwrap();
        assert_eq!(info.status, "completed");
        assert_eq!(info.progress, 1.0);
    }

    #[tokio::test]
    async fn retryable_error_is_not_terminal_for_session_info() {
        let bus = ProgressBus::new();
        bus.publish(started("f1", "alice"));
        bus.publish(UploadEvent::UploadError {
            file_id: "f1".into(),
            principal_id: "alice".into(),
            kind: "storage".into(),
            message: "disk full".into(),
            retryable: true,
            error_history: None,
            timestamp: Utc::now(),
        });
        let info = bus.session_status("f1").unwrap();
        assert_eq!(info.status, "receiving");
        assert_eq!(info.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let queue = Arc::new(SubscriberQueue::new(4));
        queue.push(progress("f", "u", 0.1));
        queue.close();
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }
}
