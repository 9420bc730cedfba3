//! UploadSessionManager: the chunked upload state machine
//!
//! Owns the session registry and coordinates the ChunkStore, the
//! PipelineOrchestrator and the RecoveryController. Sessions are keyed by
//! `file_id`; each entry sits behind its own async mutex so mutations of
//! one session never block another.
//!
//! State machine:
//!
//! ```text
//!  initializing ─init→ receiving ─assemble→ assembling ─done→ completed
//!                  │                  │
//!                  ├─cancel→ cancelled└─err(final)→ failed
//! ```

use crate::auth::Principal;
use crate::bus::ProgressSink;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{PipelineOrchestrator, StageContext};
use crate::recovery::{RecoveryAction, RecoveryController, RetryContext};
use crate::store::{AssembledFile, ChunkStore};
use crate::types::FileMetadata;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Completed/cancelled/failed sessions stay observable this long
const SESSION_TERMINAL_GRACE: Duration = Duration::from_secs(30);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Receiving,
    Assembling,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Receiving => "receiving",
            SessionStatus::Assembling => "assembling",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Server-side state for one ongoing file ingestion
pub struct UploadSession {
    pub file_id: String,
    pub owner_id: String,
    pub metadata: FileMetadata,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    /// Server-computed digest per accepted chunk; `validate` re-hashes
    /// against these for every chunk, client digest or not
    pub digests: HashMap<u32, String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub temp_dir: PathBuf,
    /// Output path captured at `complete`, re-used by assembly retries
    pub pending_final_path: Option<PathBuf>,
}

impl UploadSession {
    /// Fraction of chunks received; 1.0 for zero-chunk files
    pub fn chunk_progress(&self) -> f64 {
        if self.total_chunks == 0 {
            1.0
        } else {
            self.received.len() as f64 / self.total_chunks as f64
        }
    }
}

/// Serializable session view for `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub file_id: String,
    pub owner_id: String,
    pub status: SessionStatus,
    pub metadata: FileMetadata,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub temp_dir: String,
}

/// Result of `init`
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub file_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub start_time: DateTime<Utc>,
    pub temp_dir: PathBuf,
}

/// Result of `upload_chunk`
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub progress: f64,
    pub received: u32,
    pub total: u32,
    pub already_received: bool,
}

/// Result of `resume`
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub file_id: String,
    pub total_chunks: u32,
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub progress: f64,
}

/// Result of `complete`
#[derive(Debug, Clone)]
pub struct AssembleOutcome {
    pub path: PathBuf,
    pub size: u64,
}

/// Everything `execute_assembly` needs without re-locking the session
struct AssemblyJob {
    file_id: String,
    owner_id: String,
    metadata: FileMetadata,
    total_chunks: u32,
    expected_size: u64,
    out_path: PathBuf,
    started_at: DateTime<Utc>,
}

pub struct UploadSessionManager {
    config: Arc<Config>,
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>>,
    store: Arc<ChunkStore>,
    bus: Arc<dyn ProgressSink>,
    pipeline: Arc<PipelineOrchestrator>,
    recovery: Arc<RecoveryController>,
}

impl UploadSessionManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ChunkStore>,
        bus: Arc<dyn ProgressSink>,
        pipeline: Arc<PipelineOrchestrator>,
        recovery: Arc<RecoveryController>,
    ) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            bus,
            pipeline,
            recovery,
        }
    }

    /// Create a session. Rejects oversized files and ids already in use by
    /// a live session; a terminal session with the same id is reset.
    pub async fn init(
        &self,
        principal: &Principal,
        file_id: &str,
        metadata: FileMetadata,
    ) -> Result<InitOutcome> {
        let limit = self.config.max_file_size();
        if metadata.size > limit {
            return Err(Error::SizeExceeded {
                size: metadata.size,
                limit,
            });
        }

        let total_chunks = total_chunks_for(metadata.size, self.config.chunk_size);
        let now = Utc::now();

        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(file_id) {
                let status = existing.lock().await.status;
                if !status.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "upload session {} already active ({})",
                        file_id, status
                    )));
                }
                sessions.remove(file_id);
            }

            let temp_dir = self.store.prepare(&principal.id, file_id).await?;
            let session = UploadSession {
                file_id: file_id.to_string(),
                owner_id: principal.id.clone(),
                metadata: metadata.clone(),
                chunk_size: self.config.chunk_size,
                total_chunks,
                received: BTreeSet::new(),
                digests: HashMap::new(),
                started_at: now,
                last_activity: now,
                status: SessionStatus::Initializing,
                temp_dir: temp_dir.clone(),
                pending_final_path: None,
            };
            sessions.insert(file_id.to_string(), Arc::new(Mutex::new(session)));
        }

        // A reused id starts with a fresh retry budget
        self.recovery.reset(file_id).await;

        self.pipeline.init(file_id, &principal.id, &metadata).await;
        self.pipeline.start_stage(file_id, "upload").await?;

        // Pipeline and chunk directory are in place; open for chunks
        if let Ok(session_arc) = self.get(file_id).await {
            session_arc.lock().await.status = SessionStatus::Receiving;
        }

        self.bus.start_session(
            file_id,
            &principal.id,
            &metadata.name,
            metadata.size,
            total_chunks,
        );

        info!(
            file_id = %file_id,
            owner = %principal.id,
            size = metadata.size,
            total_chunks,
            "upload session initialized"
        );

        let temp_dir = self.store.session_dir(&principal.id, file_id)?;
        Ok(InitOutcome {
            file_id: file_id.to_string(),
            total_chunks,
            chunk_size: self.config.chunk_size,
            start_time: now,
            temp_dir,
        })
    }

    /// Accept one chunk. Re-uploads of an already-received index succeed
    /// idempotently; a client digest mismatch rejects the chunk without
    /// recording it.
    pub async fn upload_chunk(
        &self,
        principal: &Principal,
        file_id: &str,
        index: u32,
        bytes: Bytes,
        client_digest: Option<String>,
    ) -> Result<ChunkOutcome> {
        let session_arc = self.get(file_id).await?;

        let (owner_id, total) = {
            let mut session = session_arc.lock().await;
            ensure_owner(&session, principal)?;
            match session.status {
                SessionStatus::Receiving => {}
                SessionStatus::Cancelled => {
                    return Err(Error::Cancelled(format!("upload {} cancelled", file_id)))
                }
                other => {
                    return Err(Error::Conflict(format!(
                        "session {} is {}, not receiving",
                        file_id, other
                    )))
                }
            }
            if index >= session.total_chunks {
                return Err(Error::BadIndex {
                    index,
                    total: session.total_chunks,
                });
            }
            if session.received.contains(&index) {
                session.last_activity = Utc::now();
                let outcome = ChunkOutcome {
                    progress: session.chunk_progress(),
                    received: session.received.len() as u32,
                    total: session.total_chunks,
                    already_received: true,
                };
                return Ok(outcome);
            }
            (session.owner_id.clone(), session.total_chunks)
        };

        // Hash off the session lock so concurrent chunks of the same file
        // digest in parallel; only bookkeeping is serialized.
        let digest = self.compute_digest(bytes.clone()).await?;
        if let Some(client) = client_digest {
            if !client.eq_ignore_ascii_case(&digest) {
                return Err(Error::ChecksumMismatch {
                    index,
                    expected: client,
                    actual: digest,
                });
            }
        }

        if let Err(err) = self.store.write(&owner_id, file_id, index, &bytes).await {
            let action = self
                .recovery
                .handle(file_id, &owner_id, &err, RetryContext::ChunkUpload)
                .await;
            if matches!(action, RecoveryAction::Fail { .. }) {
                self.fail_session(file_id).await;
            }
            return Err(err);
        }

        let (received, progress) = {
            let mut session = session_arc.lock().await;
            if session.status == SessionStatus::Cancelled {
                // The chunk landed on disk after cancel's purge; clean up
                // the stray directory and report the cancellation.
                drop(session);
                self.store.purge(&owner_id, file_id).await;
                return Err(Error::Cancelled(format!("upload {} cancelled", file_id)));
            }
            session.received.insert(index);
            session.digests.insert(index, digest);
            session.last_activity = Utc::now();
            (session.received.len() as u32, session.chunk_progress())
        };

        self.pipeline
            .update_upload_progress(file_id, received, total)
            .await?;

        debug!(file_id = %file_id, index, received, total, "chunk accepted");
        Ok(ChunkOutcome {
            progress,
            received,
            total,
            already_received: false,
        })
    }

    /// Reconcile the session with what is actually on disk and report the
    /// gaps. The store is the source of truth; safe to call at any time.
    pub async fn resume(&self, principal: &Principal, file_id: &str) -> Result<ResumeOutcome> {
        let session_arc = self.get(file_id).await?;
        let mut session = session_arc.lock().await;
        ensure_owner(&session, principal)?;

        let total = session.total_chunks;

        // A terminal session's chunks are gone; report its last known view
        // instead of rescanning the purged directory.
        if session.status.is_terminal() {
            let received: Vec<u32> = session.received.iter().copied().collect();
            let missing: Vec<u32> = (0..total)
                .filter(|idx| !session.received.contains(idx))
                .collect();
            return Ok(ResumeOutcome {
                file_id: file_id.to_string(),
                total_chunks: total,
                received,
                missing,
                progress: session.chunk_progress(),
            });
        }

        let on_disk: BTreeSet<u32> = self
            .store
            .list(&session.owner_id, file_id)
            .await?
            .into_iter()
            .filter(|idx| *idx < total)
            .collect();

        session.digests.retain(|idx, _| on_disk.contains(idx));
        session.received = on_disk.clone();
        session.last_activity = Utc::now();

        let received: Vec<u32> = on_disk.iter().copied().collect();
        let missing: Vec<u32> = (0..total).filter(|idx| !on_disk.contains(idx)).collect();
        let progress = session.chunk_progress();

        info!(
            file_id = %file_id,
            received = received.len(),
            missing = missing.len(),
            "resume reconciled against chunk store"
        );

        Ok(ResumeOutcome {
            file_id: file_id.to_string(),
            total_chunks: total,
            received,
            missing,
            progress,
        })
    }

    /// Assemble the file and drive the post-assembly pipeline stages.
    ///
    /// Requires every chunk to be present. Exactly one caller wins the
    /// `receiving → assembling` transition; a concurrent call observes
    /// `assembling` and gets a Conflict. Failures leave the chunks in place
    /// and only reach `failed` after the RecoveryController declines a
    /// retry.
    pub async fn complete(
        &self,
        principal: &Principal,
        file_id: &str,
        final_path: &str,
    ) -> Result<AssembleOutcome> {
        let session_arc = self.get(file_id).await?;
        let out_path = confine_final_path(&self.config.uploads_path, final_path)?;
        {
            let mut session = session_arc.lock().await;
            ensure_owner(&session, principal)?;
            session.pending_final_path = Some(out_path);
        }

        let job = self.begin_assembly(file_id).await?;
        match self.execute_assembly(&job).await {
            Ok(outcome) => {
                self.finish_success(&job, &outcome).await;
                Ok(outcome)
            }
            Err((err, context)) => Err(self.dispatch_failure(&job, err, context).await),
        }
    }

    /// Cancel the upload: purge chunks, release the session, emit a
    /// terminal error event. Subsequent calls for this id see NotFound.
    pub async fn cancel(&self, principal: &Principal, file_id: &str) -> Result<()> {
        let session_arc = self.get(file_id).await?;
        let owner_id = {
            let mut session = session_arc.lock().await;
            ensure_owner(&session, principal)?;
            if session.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "session {} already {}",
                    file_id, session.status
                )));
            }
            session.status = SessionStatus::Cancelled;
            session.owner_id.clone()
        };

        self.store.purge(&owner_id, file_id).await;
        self.pipeline.remove(file_id).await;
        self.recovery.reset(file_id).await;
        self.sessions.write().await.remove(file_id);

        self.bus.error_session(
            file_id,
            &owner_id,
            "cancelled",
            "upload cancelled by client",
            false,
            None,
        );

        info!(file_id = %file_id, "upload cancelled");
        Ok(())
    }

    /// Re-digest every stored chunk against the recorded digests.
    /// Returns false on the first mismatch or missing chunk.
    pub async fn validate(&self, principal: &Principal, file_id: &str) -> Result<bool> {
        let session_arc = self.get(file_id).await?;
        let (owner_id, digests) = {
            let session = session_arc.lock().await;
            ensure_owner(&session, principal)?;
            (session.owner_id.clone(), session.digests.clone())
        };
        self.validate_chunks(&owner_id, file_id, &digests).await
    }

    /// Session view for `/status`; enforces ownership.
    pub async fn status(
        &self,
        principal: &Principal,
        file_id: &str,
    ) -> Result<Option<SessionSnapshot>> {
        let sessions = self.sessions.read().await;
        let Some(session_arc) = sessions.get(file_id) else {
            return Ok(None);
        };
        let session = session_arc.lock().await;
        if session.owner_id != principal.id {
            return Err(Error::Unauthorized(format!(
                "session {} belongs to another principal",
                file_id
            )));
        }
        Ok(Some(snapshot(&session)))
    }

    /// Number of non-terminal sessions (health endpoint).
    pub async fn active_sessions(&self) -> usize {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut active = 0;
        for session_arc in sessions {
            if !session_arc.lock().await.status.is_terminal() {
                active += 1;
            }
        }
        active
    }

    /// Retry callback for chunk-phase failures: rescan the store and
    /// re-emit progress so subscribers observe the recovery.
    pub async fn retry_resume(&self, file_id: &str) -> Result<()> {
        let session_arc = self.get(file_id).await?;
        let (total, received) = {
            let mut session = session_arc.lock().await;
            if session.status != SessionStatus::Receiving {
                return Ok(());
            }
            let total = session.total_chunks;
            let on_disk: BTreeSet<u32> = self
                .store
                .list(&session.owner_id, file_id)
                .await?
                .into_iter()
                .filter(|idx| *idx < total)
                .collect();
            session.digests.retain(|idx, _| on_disk.contains(idx));
            session.received = on_disk;
            session.last_activity = Utc::now();
            (total, session.received.len() as u32)
        };
        self.pipeline
            .update_upload_progress(file_id, received, total)
            .await?;
        info!(file_id = %file_id, received, total, "retry: session resumed");
        Ok(())
    }

    /// Retry callback for assembly failures: re-run `complete` with the
    /// output path captured on the first attempt.
    pub async fn retry_complete(&self, file_id: &str) -> Result<()> {
        let job = self.begin_assembly(file_id).await?;
        match self.execute_assembly(&job).await {
            Ok(outcome) => {
                self.finish_success(&job, &outcome).await;
                Ok(())
            }
            Err((err, context)) => Err(self.dispatch_failure(&job, err, context).await),
        }
    }

    /// Retry callback for a failed pipeline stage: restart it and keep
    /// driving the remaining stages.
    pub async fn retry_stage(&self, file_id: &str, stage: &str) -> Result<()> {
        let session_arc = self.get(file_id).await?;
        let job = {
            let session = session_arc.lock().await;
            if session.status != SessionStatus::Assembling {
                return Ok(());
            }
            let out_path = session.pending_final_path.clone().ok_or_else(|| {
                Error::Internal(format!("session {} has no pending output path", file_id))
            })?;
            AssemblyJob {
                file_id: file_id.to_string(),
                owner_id: session.owner_id.clone(),
                metadata: session.metadata.clone(),
                total_chunks: session.total_chunks,
                expected_size: session.metadata.size,
                out_path,
                started_at: session.started_at,
            }
        };

        self.pipeline.restart_stage(file_id, stage).await?;
        let assembled = AssembledFile {
            path: job.out_path.clone(),
            size: job.expected_size,
        };
        match self.run_remaining_stages(&job, &assembled).await {
            Ok(()) => {
                let outcome = AssembleOutcome {
                    path: assembled.path,
                    size: assembled.size,
                };
                self.finish_success(&job, &outcome).await;
                Ok(())
            }
            Err((err, context)) => Err(self.dispatch_failure(&job, err, context).await),
        }
    }

    /// Enforce inactivity timeouts, the absolute TTL, and the terminal
    /// grace backstop. Runs from the background sweeper.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.chunk_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let grace = chrono::Duration::from_std(SESSION_TERMINAL_GRACE)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let entries: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut expired = Vec::new();
        for (file_id, session_arc) in entries {
            let mut session = session_arc.lock().await;
            let age = now - session.started_at;
            let idle = now - session.last_activity;

            if session.status.is_terminal() {
                if idle > grace {
                    expired.push((file_id, session.owner_id.clone()));
                }
                continue;
            }

            if age > ttl {
                warn!(file_id = %file_id, "session exceeded 24h TTL, evicting");
                session.status = SessionStatus::Failed;
                expired.push((file_id, session.owner_id.clone()));
                continue;
            }

            if idle > timeout {
                warn!(file_id = %file_id, "session timed out after inactivity");
                session.status = SessionStatus::Failed;
                let owner = session.owner_id.clone();
                drop(session);
                self.store.purge(&owner, &file_id).await;
                self.bus.error_session(
                    &file_id,
                    &owner,
                    "timeout",
                    &format!("upload {} timed out waiting for chunks", file_id),
                    false,
                    None,
                );
            }
        }

        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for (file_id, owner) in &expired {
                sessions.remove(file_id);
                self.store.purge(owner, file_id).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Assembly internals
    // ------------------------------------------------------------------

    /// Win the `receiving → assembling` transition or report why not.
    async fn begin_assembly(&self, file_id: &str) -> Result<AssemblyJob> {
        let session_arc = self.get(file_id).await?;
        let mut session = session_arc.lock().await;
        match session.status {
            SessionStatus::Receiving => {}
            SessionStatus::Assembling => {
                return Err(Error::Conflict(format!(
                    "assembly already in progress for {}",
                    file_id
                )))
            }
            other => {
                return Err(Error::Conflict(format!(
                    "session {} is {}, not receiving",
                    file_id, other
                )))
            }
        }
        let received = session.received.len() as u32;
        if received != session.total_chunks {
            return Err(Error::Conflict(format!(
                "upload incomplete: {}/{} chunks received",
                received, session.total_chunks
            )));
        }
        let out_path = session.pending_final_path.clone().ok_or_else(|| {
            Error::BadRequest("finalPath is required to complete an upload".into())
        })?;
        session.status = SessionStatus::Assembling;
        session.last_activity = Utc::now();
        Ok(AssemblyJob {
            file_id: file_id.to_string(),
            owner_id: session.owner_id.clone(),
            metadata: session.metadata.clone(),
            total_chunks: session.total_chunks,
            expected_size: session.metadata.size,
            out_path,
            started_at: session.started_at,
        })
    }

    /// Validation + assembly + post-assembly stages. Errors carry the
    /// retry context so the caller can route them through recovery.
    async fn execute_assembly(
        &self,
        job: &AssemblyJob,
    ) -> std::result::Result<AssembleOutcome, (Error, RetryContext)> {
        let file_id = job.file_id.as_str();
        let assembly = |e: Error| (e, RetryContext::Assembly);

        self.pipeline
            .complete_stage(file_id, "upload")
            .await
            .map_err(assembly)?;

        self.pipeline
            .start_stage(file_id, "validation")
            .await
            .map_err(assembly)?;
        let digests = {
            let session_arc = self.get(file_id).await.map_err(assembly)?;
            let session = session_arc.lock().await;
            session.digests.clone()
        };
        let valid = self
            .validate_chunks(&job.owner_id, file_id, &digests)
            .await
            .map_err(assembly)?;
        if !valid {
            return Err(assembly(Error::Internal(format!(
                "stored chunks failed digest validation for {}",
                file_id
            ))));
        }
        self.pipeline
            .complete_stage(file_id, "validation")
            .await
            .map_err(assembly)?;

        self.pipeline
            .start_stage(file_id, "processing")
            .await
            .map_err(assembly)?;
        let order: Vec<u32> = (0..job.total_chunks).collect();
        let assembled = self
            .store
            .assemble(
                &job.owner_id,
                file_id,
                &order,
                &job.out_path,
                job.expected_size,
            )
            .await
            .map_err(assembly)?;
        self.pipeline
            .complete_stage(file_id, "processing")
            .await
            .map_err(assembly)?;

        // Chunks are only released once the assembled file is on disk
        self.store.purge(&job.owner_id, file_id).await;

        self.run_remaining_stages(job, &assembled).await?;

        Ok(AssembleOutcome {
            path: assembled.path,
            size: assembled.size,
        })
    }

    /// Drive every stage after `processing` through its registered handler.
    async fn run_remaining_stages(
        &self,
        job: &AssemblyJob,
        assembled: &AssembledFile,
    ) -> std::result::Result<(), (Error, RetryContext)> {
        loop {
            let next = self
                .pipeline
                .next_pending_stage(&job.file_id)
                .await
                .map_err(|e| (e, RetryContext::Assembly))?;
            let Some(stage) = next else { break };
            let ctx = StageContext {
                file_id: job.file_id.clone(),
                owner_id: job.owner_id.clone(),
                stage: stage.clone(),
                file_path: Some(assembled.path.clone()),
                metadata: job.metadata.clone(),
            };
            self.pipeline
                .run_stage(&ctx)
                .await
                .map_err(|e| (e, RetryContext::Stage(stage.clone())))?;
        }
        Ok(())
    }

    async fn finish_success(&self, job: &AssemblyJob, outcome: &AssembleOutcome) {
        if let Ok(session_arc) = self.get(&job.file_id).await {
            let mut session = session_arc.lock().await;
            session.status = SessionStatus::Completed;
            session.last_activity = Utc::now();
        }

        let duration_ms = (Utc::now() - job.started_at).num_milliseconds().max(0) as u64;
        self.recovery.mark_retry_succeeded(&job.file_id).await;
        self.bus.complete_session(
            &job.file_id,
            &job.owner_id,
            Some(outcome.path.display().to_string()),
            Some(outcome.size),
            duration_ms,
        );
        self.schedule_removal(&job.file_id, SESSION_TERMINAL_GRACE);

        info!(
            file_id = %job.file_id,
            path = %outcome.path.display(),
            size = outcome.size,
            duration_ms,
            "upload completed"
        );
    }

    /// Route an assembly-phase failure through recovery and apply the
    /// resulting state transition. Returns the original error for the
    /// caller to surface.
    async fn dispatch_failure(
        &self,
        job: &AssemblyJob,
        err: Error,
        context: RetryContext,
    ) -> Error {
        let action = self
            .recovery
            .handle(&job.file_id, &job.owner_id, &err, context.clone())
            .await;
        match action {
            RecoveryAction::Retry { .. } => match &context {
                RetryContext::Stage(stage) => {
                    // Stage parks in error until the retry restarts it
                    let _ = self
                        .pipeline
                        .handle_stage_error(&job.file_id, stage, &err.to_string(), true)
                        .await;
                }
                _ => {
                    // Chunks are untouched; fall back to receiving so the
                    // scheduled retry can re-run assembly
                    if let Ok(session_arc) = self.get(&job.file_id).await {
                        let mut session = session_arc.lock().await;
                        if session.status == SessionStatus::Assembling {
                            session.status = SessionStatus::Receiving;
                        }
                    }
                }
            },
            RecoveryAction::Fail { .. } => {
                if let RetryContext::Stage(stage) = &context {
                    let _ = self
                        .pipeline
                        .handle_stage_error(&job.file_id, stage, &err.to_string(), false)
                        .await;
                }
                self.fail_session(&job.file_id).await;
            }
        }
        err
    }

    /// Transition to `failed`, purge chunks, keep the record observable
    /// for the grace period. The terminal event was already emitted by the
    /// RecoveryController.
    async fn fail_session(&self, file_id: &str) {
        let Ok(session_arc) = self.get(file_id).await else {
            return;
        };
        let owner_id = {
            let mut session = session_arc.lock().await;
            session.status = SessionStatus::Failed;
            session.last_activity = Utc::now();
            session.owner_id.clone()
        };
        self.store.purge(&owner_id, file_id).await;
        self.schedule_removal(file_id, SESSION_TERMINAL_GRACE);
        warn!(file_id = %file_id, "session failed permanently");
    }

    async fn validate_chunks(
        &self,
        owner_id: &str,
        file_id: &str,
        digests: &HashMap<u32, String>,
    ) -> Result<bool> {
        for (index, expected) in digests {
            let bytes = match self.store.read(owner_id, file_id, *index).await {
                Ok(bytes) => bytes,
                Err(Error::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            let actual = self.compute_digest(Bytes::from(bytes)).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(file_id = %file_id, index, "chunk digest mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn compute_digest(&self, bytes: Bytes) -> Result<String> {
        let algo = self.config.digest;
        tokio::task::spawn_blocking(move || algo.digest_hex(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("digest task failed: {}", e)))
    }

    fn schedule_removal(&self, file_id: &str, delay: Duration) {
        let file_id = file_id.to_string();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut sessions = sessions.write().await;
            // The id may have been reused by a fresh session since this
            // timer was armed; only terminal sessions are released.
            let terminal = match sessions.get(&file_id) {
                Some(session_arc) => session_arc.lock().await.status.is_terminal(),
                None => false,
            };
            if terminal {
                sessions.remove(&file_id);
                debug!(file_id = %file_id, "terminal session released");
            }
        });
    }

    async fn get(&self, file_id: &str) -> Result<Arc<Mutex<UploadSession>>> {
        self.sessions
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no upload session for {}", file_id)))
    }
}

fn ensure_owner(session: &UploadSession, principal: &Principal) -> Result<()> {
    if session.owner_id != principal.id {
        return Err(Error::Unauthorized(format!(
            "session {} belongs to another principal",
            session.file_id
        )));
    }
    Ok(())
}

fn total_chunks_for(size: u64, chunk_size: u64) -> u32 {
    if size == 0 || chunk_size == 0 {
        0
    } else {
        size.div_ceil(chunk_size) as u32
    }
}

fn snapshot(session: &UploadSession) -> SessionSnapshot {
    SessionSnapshot {
        file_id: session.file_id.clone(),
        owner_id: session.owner_id.clone(),
        status: session.status,
        metadata: session.metadata.clone(),
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        received_chunks: session.received.len() as u32,
        progress: session.chunk_progress(),
        start_time: session.started_at,
        last_activity: session.last_activity,
        temp_dir: session.temp_dir.display().to_string(),
    }
}

/// Keep the client-requested output path inside the uploads root.
fn confine_final_path(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.trim().is_empty() {
        return Err(Error::BadRequest("finalPath is required".into()));
    }
    let requested_path = Path::new(requested);
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::BadRequest(
                "finalPath may not contain parent-directory components".into(),
            ));
        }
    }
    if requested_path.is_absolute() {
        if !requested_path.starts_with(root) {
            return Err(Error::BadRequest(
                "finalPath escapes the uploads root".into(),
            ));
        }
        Ok(requested_path.to_path_buf())
    } else {
        Ok(root.join(requested_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks_for(0, 1024), 0);
        assert_eq!(total_chunks_for(1, 1024), 1);
        assert_eq!(total_chunks_for(1024, 1024), 1);
        assert_eq!(total_chunks_for(1025, 1024), 2);
        assert_eq!(total_chunks_for(3 * 1_048_576, 1_048_576), 3);
    }

    #[test]
    fn confine_rejects_escapes() {
        let root = Path::new("/srv/uploads");
        assert!(confine_final_path(root, "").is_err());
        assert!(confine_final_path(root, "../../etc/passwd").is_err());
        assert!(confine_final_path(root, "a/../../b").is_err());
        assert!(confine_final_path(root, "/etc/passwd").is_err());

        assert_eq!(
            confine_final_path(root, "docs/report.pdf").unwrap(),
            PathBuf::from("/srv/uploads/docs/report.pdf")
        );
        assert_eq!(
            confine_final_path(root, "/srv/uploads/direct.bin").unwrap(),
            PathBuf::from("/srv/uploads/direct.bin")
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Receiving.is_terminal());
        assert!(!SessionStatus::Assembling.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn chunk_progress_handles_zero_chunks() {
        let session = UploadSession {
            file_id: "f".into(),
            owner_id: "u".into(),
            metadata: FileMetadata {
                name: "empty.bin".into(),
                size: 0,
                content_type: None,
                tool_resource: None,
                agent_id: None,
            },
            chunk_size: 1024,
            total_chunks: 0,
            received: BTreeSet::new(),
            digests: HashMap::new(),
            started_at: Utc::now(),
            last_activity: Utc::now(),
            status: SessionStatus::Receiving,
            temp_dir: PathBuf::from("/tmp"),
            pending_final_path: None,
        };
        assert_eq!(session.chunk_progress(), 1.0);
    }
}
