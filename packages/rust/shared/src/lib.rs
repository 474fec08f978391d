//! Shared types, error model, and configuration for memforge.
//!
//! This crate is the foundation depended on by all other memforge crates.
//! It provides:
//! - [`MemforgeError`] — the unified error type
//! - Domain types ([`RunId`], [`UploadBatch`], [`ArtifactId`], [`ArtifactSet`])
//! - Configuration ([`AppConfig`], [`StagesConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DecodePolicy, IntakeConfig, ScratchConfig, StagesConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{MemforgeError, Result};
pub use types::{
    ArtifactId, ArtifactSet, COMBINED_DOCUMENT_NAME, CURRENT_SCHEMA_VERSION, DOWNLOAD_ROUTE,
    DownloadLinks, RunId, StageKind, UploadBatch, UploadFile,
};
