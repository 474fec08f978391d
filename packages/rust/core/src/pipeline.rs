//! End-to-end processing: upload batch → combined document → smart dataset →
//! fine-tune dataset → artifact set.
//!
//! Each call to [`Pipeline::process`] gets a fresh run namespace, so any number
//! of runs may be in flight at once without sharing a path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, instrument};

use memforge_artifacts::{RunManifest, describe_artifact, write_manifest};
use memforge_shared::{
    AppConfig, ArtifactSet, DecodePolicy, MemforgeError, Result, RunId, StageKind, UploadBatch,
};
use memforge_storage::{RunDir, ScratchStore};

use crate::intake;
use crate::stage::{Stage, StageResult, SubprocessStage};

/// Where a run currently is.
///
/// `Idle → Aggregating → Stage1Running → Stage2Running → Complete`, with any
/// non-terminal state able to move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Aggregating,
    Stage1Running,
    Stage2Running,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Aggregating => "combining uploads",
            Self::Stage1Running => "generating smart dataset",
            Self::Stage2Running => "preparing fine-tune dataset",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub artifacts: ArtifactSet,
    pub manifest: RunManifest,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called on every state transition, including the terminal one.
    fn state_changed(&self, run_id: RunId, state: PipelineState);
    /// Called once after a run completes successfully.
    fn done(&self, run: &PipelineRun);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn state_changed(&self, _run_id: RunId, _state: PipelineState) {}
    fn done(&self, _run: &PipelineRun) {}
}

/// The two-stage pipeline over a scratch store.
#[derive(Clone)]
pub struct Pipeline {
    store: ScratchStore,
    smart: Arc<dyn Stage>,
    finetune: Arc<dyn Stage>,
    decode: DecodePolicy,
}

impl Pipeline {
    pub fn new(store: ScratchStore, smart: Arc<dyn Stage>, finetune: Arc<dyn Stage>) -> Self {
        Self {
            store,
            smart,
            finetune,
            decode: DecodePolicy::default(),
        }
    }

    /// Subprocess stages and decode policy taken from `config`.
    pub fn from_config(store: ScratchStore, config: &AppConfig) -> Self {
        let smart = SubprocessStage::from_config(StageKind::Smart, &config.stages);
        let finetune = SubprocessStage::from_config(StageKind::Finetune, &config.stages);
        Self::new(store, Arc::new(smart), Arc::new(finetune))
            .with_decode_policy(config.intake.decode)
    }

    pub fn with_decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.decode = policy;
        self
    }

    pub fn store(&self) -> &ScratchStore {
        &self.store
    }

    /// Run one batch through both stages.
    ///
    /// Stops at the first failure: a failed aggregation never starts stage 1,
    /// and a failed stage 1 never starts stage 2. Artifacts are only reported
    /// once both stages have succeeded.
    #[instrument(skip_all, fields(files = batch.len(), bytes = batch.total_bytes()))]
    pub async fn process(
        &self,
        batch: &UploadBatch,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineRun> {
        let run_id = RunId::new();
        enter(progress, run_id, PipelineState::Idle);

        match self.run(run_id, batch, progress).await {
            Ok(run) => {
                enter(progress, run_id, PipelineState::Complete);
                progress.done(&run);
                Ok(run)
            }
            Err(e) => {
                error!(%run_id, error = %e, "pipeline run failed");
                enter(progress, run_id, PipelineState::Failed);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        run_id: RunId,
        batch: &UploadBatch,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineRun> {
        let start = Instant::now();
        let created_at = Utc::now();
        info!(%run_id, "starting pipeline run");

        // --- Aggregation ---
        enter(progress, run_id, PipelineState::Aggregating);
        let run_dir = self
            .store
            .create_run(run_id)
            .map_err(MemforgeError::aggregation)?;
        let combined =
            intake::aggregate(&run_dir, batch, self.decode).map_err(MemforgeError::aggregation)?;

        // --- Stage 1: raw text → smart dataset ---
        enter(progress, run_id, PipelineState::Stage1Running);
        let smart_out = run_dir.stage_output(StageKind::Smart);
        let result = self.smart.run(combined.path(), &smart_out).await?;
        check_stage(StageKind::Smart, result, &run_dir)?;

        // --- Stage 2: smart dataset → fine-tune dataset ---
        enter(progress, run_id, PipelineState::Stage2Running);
        let finetune_out = run_dir.stage_output(StageKind::Finetune);
        let result = self.finetune.run(&smart_out, &finetune_out).await?;
        check_stage(StageKind::Finetune, result, &run_dir)?;

        // --- Publish ---
        let artifacts = ArtifactSet::for_run(run_id);
        let metas = vec![
            describe_artifact(&self.store, &artifacts.smart)?,
            describe_artifact(&self.store, &artifacts.finetune)?,
        ];
        let uploads = batch.files().iter().map(|f| f.name.clone()).collect();
        let manifest = RunManifest::new(run_id, created_at, uploads, metas);
        write_manifest(&run_dir, &manifest)?;

        let elapsed = start.elapsed();
        info!(
            %run_id,
            smart = %artifacts.smart,
            finetune = %artifacts.finetune,
            elapsed_ms = elapsed.as_millis(),
            "pipeline run complete"
        );

        Ok(PipelineRun {
            artifacts,
            manifest,
            elapsed,
        })
    }
}

fn enter(progress: &dyn ProgressReporter, run_id: RunId, state: PipelineState) {
    debug!(%run_id, %state, "pipeline state");
    progress.state_changed(run_id, state);
}

/// Turn a stage outcome into an error unless it succeeded and left its output.
fn check_stage(stage: StageKind, result: StageResult, run_dir: &RunDir) -> Result<()> {
    if !result.is_success() {
        return Err(MemforgeError::StageFailed {
            stage,
            exit_code: result.exit_code,
            diagnostics: result.diagnostics,
        });
    }

    let expected = run_dir.stage_output(stage);
    if !expected.is_file() {
        let mut diagnostics = result.diagnostics;
        if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
            diagnostics.push('\n');
        }
        diagnostics.push_str(&format!("no output was written to {}", expected.display()));
        return Err(MemforgeError::StageFailed {
            stage,
            exit_code: result.exit_code,
            diagnostics,
        });
    }
    Ok(())
}
