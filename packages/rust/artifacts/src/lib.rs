//! Artifact retrieval and run manifests.
//!
//! This crate provides:
//! - [`ArtifactStore`] — resolves an [`ArtifactId`](memforge_shared::ArtifactId)
//!   to a byte stream, with traversal checks and a distinct not-found error
//! - [`manifest`] — checksummed record of what a completed run produced

pub mod manifest;
pub mod retriever;

pub use manifest::{ArtifactMeta, RunManifest, describe_artifact, load_manifest, write_manifest};
pub use retriever::{ArtifactStore, ArtifactStream, DEFAULT_PREVIEW_LINES};
