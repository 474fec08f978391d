//! Core pipeline orchestration for memforge.
//!
//! Ties the intake aggregator, the two subprocess stages, and the artifact
//! manifest together into a single `process` call.

pub mod intake;
pub mod pipeline;
pub mod stage;

pub use pipeline::{Pipeline, PipelineRun, PipelineState, ProgressReporter, SilentProgress};
pub use stage::{Stage, StageResult, StageStatus, SubprocessStage};
