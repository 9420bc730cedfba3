//! PipelineOrchestrator: per-file weighted stage machine
//!
//! Each file gets an ordered stage list derived from its metadata. Stages
//! run one at a time; aggregate progress is the weight-normalized sum over
//! the stages actually included, and the emitted value is monotonically
//! non-decreasing. Stage handlers are pluggable through `StageRunner`.

use crate::bus::ProgressSink;
use crate::error::{Error, Result};
use crate::types::FileMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Canonical stage table: name, weight, ordered as stages execute.
///
/// Weights deliberately do not sum to 1; the aggregate divides by the sum of
/// the weights of the stages included in a given pipeline.
pub const STAGE_TABLE: &[(&str, f64)] = &[
    ("upload", 0.10),
    ("validation", 0.05),
    ("processing", 0.30),
    ("ocr", 0.20),
    ("stt", 0.15),
    ("embedding", 0.10),
    ("storage", 0.05),
    ("cleanup", 0.05),
];

/// Stages every pipeline carries regardless of metadata
const BASELINE_STAGES: &[&str] = &["upload", "validation", "processing", "storage", "cleanup"];

/// Terminal pipelines are evicted this long after finishing
const PIPELINE_TERMINAL_GRACE: Duration = Duration::from_secs(60);

/// Stage list for a file, in canonical order, derived from its metadata.
pub fn stage_plan(tool_resource: Option<&str>, content_type: Option<&str>) -> Vec<(&'static str, f64)> {
    STAGE_TABLE
        .iter()
        .filter(|(name, _)| match *name {
            "ocr" => tool_resource == Some("ocr"),
            "stt" => content_type.is_some_and(|t| t.starts_with("audio/")),
            "embedding" => tool_resource == Some("file_search"),
            _ => BASELINE_STAGES.contains(name),
        })
        .copied()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub weight: f64,
    pub status: StageStatus,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Stage {
    fn new(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
            status: StageStatus::Pending,
            progress: 0.0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Contribution to the aggregate: completed counts as 1, running as its
    /// own progress, anything else as 0.
    fn contribution(&self) -> f64 {
        match self.status {
            StageStatus::Completed => 1.0,
            StageStatus::Running => self.progress,
            _ => 0.0,
        }
    }
}

/// One transition in the pipeline's history
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub stage: String,
    pub status: StageStatus,
    pub timestamp: DateTime<Utc>,
}

struct PipelineState {
    file_id: String,
    owner_id: String,
    stages: Vec<Stage>,
    started_at: DateTime<Utc>,
    errors: Vec<String>,
    warnings: Vec<String>,
    history: Vec<StageTransition>,
    /// High-water mark enforcing monotonic emitted progress
    last_emitted: f64,
    failed: bool,
}

impl PipelineState {
    fn overall_progress(&self) -> f64 {
        let total_weight: f64 = self.stages.iter().map(|s| s.weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = self
            .stages
            .iter()
            .map(|s| s.weight * s.contribution())
            .sum();
        weighted / total_weight
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut Stage> {
        self.stages
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::NotFound(format!("stage {} not in pipeline", name)))
    }

    fn record(&mut self, stage: &str, status: StageStatus) {
        self.history.push(StageTransition {
            stage: stage.to_string(),
            status,
            timestamp: Utc::now(),
        });
    }

    fn is_complete(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status == StageStatus::Completed)
    }
}

/// Serializable view for `/status` and `/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub file_id: String,
    pub stages: Vec<StageSnapshot>,
    pub overall_progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub history: Vec<StageTransition>,
    pub started_at: DateTime<Utc>,
    pub failed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSnapshot {
    pub name: String,
    pub weight: f64,
    pub status: StageStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Stage> for StageSnapshot {
    fn from(stage: &Stage) -> Self {
        let duration_ms = match (stage.started_at, stage.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        Self {
            name: stage.name.clone(),
            weight: stage.weight,
            status: stage.status,
            progress: stage.progress,
            started_at: stage.started_at,
            ended_at: stage.ended_at,
            duration_ms,
            error: stage.error.clone(),
        }
    }
}

/// Everything a stage handler needs to do its work
#[derive(Debug, Clone)]
pub struct StageContext {
    pub file_id: String,
    pub owner_id: String,
    pub stage: String,
    /// Assembled file, present for post-assembly stages
    pub file_path: Option<PathBuf>,
    pub metadata: FileMetadata,
}

/// Pluggable stage handler (OCR, STT, embedding, storage, cleanup workers
/// register implementations; the default runner is an in-process no-op).
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()>;
}

/// Default handler: logs the stage and succeeds immediately.
pub struct NoopStageRunner;

#[async_trait]
impl StageRunner for NoopStageRunner {
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        debug!(file_id = %ctx.file_id, stage = %ctx.stage, "stage handler (noop)");
        Ok(())
    }
}

/// Drives weighted stage lists and surfaces aggregated progress
pub struct PipelineOrchestrator {
    /// Registry shared with delayed eviction tasks
    pipelines: Arc<RwLock<HashMap<String, Arc<Mutex<PipelineState>>>>>,
    runners: RwLock<HashMap<String, Arc<dyn StageRunner>>>,
    bus: Arc<dyn ProgressSink>,
}

impl PipelineOrchestrator {
    pub fn new(bus: Arc<dyn ProgressSink>) -> Self {
        Self {
            pipelines: Arc::new(RwLock::new(HashMap::new())),
            runners: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Register a handler for a named stage, replacing any previous one.
    pub async fn register_runner(&self, stage: &str, runner: Arc<dyn StageRunner>) {
        self.runners
            .write()
            .await
            .insert(stage.to_string(), runner);
    }

    /// Create the pipeline for a file with the stage list derived from its
    /// metadata. Replaces any prior pipeline for the same file.
    pub async fn init(&self, file_id: &str, owner_id: &str, metadata: &FileMetadata) {
        let plan = stage_plan(
            metadata.tool_resource.as_deref(),
            metadata.content_type.as_deref(),
        );
        let stages: Vec<Stage> = plan
            .iter()
            .map(|(name, weight)| Stage::new(name, *weight))
            .collect();
        info!(
            file_id = %file_id,
            owner = %owner_id,
            stages = ?plan.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            "pipeline initialized"
        );
        let state = PipelineState {
            file_id: file_id.to_string(),
            owner_id: owner_id.to_string(),
            stages,
            started_at: Utc::now(),
            errors: Vec::new(),
            warnings: Vec::new(),
            history: Vec::new(),
            last_emitted: 0.0,
            failed: false,
        };
        self.pipelines
            .write()
            .await
            .insert(file_id.to_string(), Arc::new(Mutex::new(state)));
    }

    /// Transition `name` to running; a prior running stage still running is
    /// completed first.
    pub async fn start_stage(&self, file_id: &str, name: &str) -> Result<()> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        let now = Utc::now();
        for stage in state.stages.iter_mut() {
            if stage.status == StageStatus::Running && stage.name != name {
                stage.status = StageStatus::Completed;
                stage.progress = 1.0;
                stage.ended_at = Some(now);
            }
        }
        let stage = state.stage_mut(name)?;
        if stage.status == StageStatus::Running {
            return Ok(());
        }
        stage.status = StageStatus::Running;
        stage.progress = 0.0;
        stage.started_at = Some(now);
        stage.error = None;
        state.record(name, StageStatus::Running);
        debug!(file_id = %file_id, stage = %name, "stage started");
        Ok(())
    }

    /// Update a running stage's progress and emit the aggregate.
    pub async fn update_stage_progress(&self, file_id: &str, name: &str, progress: f64) -> Result<()> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        let clamped = progress.clamp(0.0, 1.0);
        {
            let stage = state.stage_mut(name)?;
            stage.progress = stage.progress.max(clamped);
        }
        self.emit_progress(&mut state, Some(name), None);
        Ok(())
    }

    /// Chunk-driven update of the upload stage. The emitted event carries
    /// the received/total chunk counts alongside the aggregate progress.
    pub async fn update_upload_progress(&self, file_id: &str, received: u32, total: u32) -> Result<()> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        let ratio = if total == 0 {
            1.0
        } else {
            received as f64 / total as f64
        };
        {
            let stage = state.stage_mut("upload")?;
            stage.progress = stage.progress.max(ratio.clamp(0.0, 1.0));
        }
        self.emit_progress(&mut state, Some("upload"), Some((received, total)));
        Ok(())
    }

    /// Mark a stage completed; returns true when it was the last one.
    pub async fn complete_stage(&self, file_id: &str, name: &str) -> Result<bool> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        let now = Utc::now();
        {
            let stage = state.stage_mut(name)?;
            if stage.status != StageStatus::Completed {
                stage.status = StageStatus::Completed;
                stage.progress = 1.0;
                stage.ended_at = Some(now);
            }
        }
        state.record(name, StageStatus::Completed);
        self.emit_progress(&mut state, Some(name), None);

        let done = state.is_complete();
        drop(state);
        if done {
            info!(file_id = %file_id, "pipeline complete");
            self.schedule_eviction(file_id);
        }
        Ok(done)
    }

    /// Record a stage error. A recoverable error parks the stage in `error`
    /// until a retry restarts it; a fatal one marks the pipeline failed and
    /// schedules eviction. Event emission is owned by the RecoveryController.
    pub async fn handle_stage_error(
        &self,
        file_id: &str,
        name: &str,
        message: &str,
        recoverable: bool,
    ) -> Result<()> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        {
            let stage = state.stage_mut(name)?;
            stage.status = StageStatus::Error;
            stage.error = Some(message.to_string());
        }
        state.errors.push(format!("{}: {}", name, message));
        state.record(name, StageStatus::Error);
        if recoverable {
            warn!(file_id = %file_id, stage = %name, error = %message, "stage error, awaiting retry");
        } else {
            state.failed = true;
            warn!(file_id = %file_id, stage = %name, error = %message, "pipeline failed");
            drop(state);
            self.schedule_eviction(file_id);
        }
        Ok(())
    }

    /// Reset an errored stage back to running (retry path).
    pub async fn restart_stage(&self, file_id: &str, name: &str) -> Result<()> {
        let pipeline = self.get(file_id).await?;
        let mut state = pipeline.lock().await;
        if state.failed {
            return Err(Error::Conflict(format!(
                "pipeline for {} already failed",
                file_id
            )));
        }
        let stage = state.stage_mut(name)?;
        if stage.status != StageStatus::Error {
            return Err(Error::Conflict(format!(
                "stage {} is not in error state",
                name
            )));
        }
        stage.status = StageStatus::Running;
        stage.progress = 0.0;
        stage.error = None;
        stage.started_at = Some(Utc::now());
        state.record(name, StageStatus::Running);
        info!(file_id = %file_id, stage = %name, "stage restarted");
        Ok(())
    }

    /// Run one stage through its registered handler: start, execute,
    /// complete. Handler failures propagate so the caller can route them
    /// through recovery.
    pub async fn run_stage(&self, ctx: &StageContext) -> Result<bool> {
        self.start_stage(&ctx.file_id, &ctx.stage).await?;
        let runner = {
            let runners = self.runners.read().await;
            runners.get(&ctx.stage).cloned()
        };
        let result = match runner {
            Some(runner) => runner.run(ctx).await,
            None => NoopStageRunner.run(ctx).await,
        };
        match result {
            Ok(()) => self.complete_stage(&ctx.file_id, &ctx.stage).await,
            Err(e) => Err(Error::Internal(format!(
                "stage {} failed: {}",
                ctx.stage, e
            ))),
        }
    }

    /// Name of the next stage that has not completed, in canonical order.
    pub async fn next_pending_stage(&self, file_id: &str) -> Result<Option<String>> {
        let pipeline = self.get(file_id).await?;
        let state = pipeline.lock().await;
        Ok(state
            .stages
            .iter()
            .find(|s| s.status != StageStatus::Completed)
            .map(|s| s.name.clone()))
    }

    pub async fn status(&self, file_id: &str) -> Option<PipelineSnapshot> {
        let pipeline = self.pipelines.read().await.get(file_id).cloned()?;
        let state = pipeline.lock().await;
        Some(snapshot(&state))
    }

    pub async fn active_pipelines(&self) -> Vec<PipelineSnapshot> {
        let pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let state = pipeline.lock().await;
            out.push(snapshot(&state));
        }
        out
    }

    pub async fn remove(&self, file_id: &str) {
        self.pipelines.write().await.remove(file_id);
    }

    fn emit_progress(&self, state: &mut PipelineState, stage: Option<&str>, chunks: Option<(u32, u32)>) {
        let computed = state.overall_progress();
        // Monotonicity: never emit below the high-water mark
        let progress = state.last_emitted.max(computed);
        state.last_emitted = progress;
        self.bus
            .update_progress(&state.file_id, &state.owner_id, progress, chunks, stage);
    }

    fn schedule_eviction(&self, file_id: &str) {
        let file_id = file_id.to_string();
        let pipelines = Arc::clone(&self.pipelines);
        tokio::spawn(async move {
            tokio::time::sleep(PIPELINE_TERMINAL_GRACE).await;
            let mut pipelines = pipelines.write().await;
            // The id may belong to a fresh pipeline by now; only evict a
            // terminal one.
            let terminal = match pipelines.get(&file_id) {
                Some(pipeline) => {
                    let state = pipeline.lock().await;
                    state.failed || state.is_complete()
                }
                None => false,
            };
            if terminal {
                pipelines.remove(&file_id);
                debug!(file_id = %file_id, "terminal pipeline evicted");
            }
        });
    }

    async fn get(&self, file_id: &str) -> Result<Arc<Mutex<PipelineState>>> {
        self.pipelines
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no pipeline for {}", file_id)))
    }
}

fn snapshot(state: &PipelineState) -> PipelineSnapshot {
    PipelineSnapshot {
        file_id: state.file_id.clone(),
        stages: state.stages.iter().map(StageSnapshot::from).collect(),
        overall_progress: state.last_emitted.max(state.overall_progress()),
        current_stage: state
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
            .map(|s| s.name.clone()),
        errors: state.errors.clone(),
        warnings: state.warnings.clone(),
        history: state.history.clone(),
        started_at: state.started_at,
        failed: state.failed,
    }
}
