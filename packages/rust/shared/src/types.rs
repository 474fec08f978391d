//! Core domain types for memforge pipeline runs.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemforgeError, Result};

/// Current schema version for the run manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// File name of the combined document inside a run namespace.
pub const COMBINED_DOCUMENT_NAME: &str = "data.txt";

/// Route prefix used when rendering artifact download links.
pub const DOWNLOAD_ROUTE: &str = "/api/download";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
///
/// Every run writes only below `runs/<run-id>/`, so concurrent runs never
/// touch each other's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

/// The two transformation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Stage 1: combined raw text → smart structured dataset.
    Smart,
    /// Stage 2: smart dataset → fine-tune dataset.
    Finetune,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Finetune => "finetune",
        }
    }

    /// Human-readable activity, used in failure messages.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Smart => "generating smart dataset",
            Self::Finetune => "preparing fine-tune dataset",
        }
    }

    /// File name this stage writes inside the run namespace.
    pub fn output_file_name(&self) -> &'static str {
        match self {
            Self::Smart => "memories.jsonl",
            Self::Finetune => "finetune_data.jsonl",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// UploadBatch
// ---------------------------------------------------------------------------

/// A single uploaded file: its client-supplied name and raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Ordered, non-empty set of uploads processed by one run.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    files: Vec<UploadFile>,
}

impl UploadBatch {
    /// Build a batch, rejecting an empty file list before anything touches disk.
    pub fn new(files: Vec<UploadFile>) -> Result<Self> {
        if files.is_empty() {
            return Err(MemforgeError::validation(
                "upload batch is empty: at least one file is required",
            ));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[UploadFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always false for a constructed batch; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.content.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// ArtifactId
// ---------------------------------------------------------------------------

static FILE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));

/// Identifies a retrievable file: `<run-id>/<file-name>`.
///
/// Both components are validated on construction, so a parsed id can never
/// name a path outside its run namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    run: RunId,
    file_name: String,
}

impl ArtifactId {
    pub fn new(run: RunId, file_name: impl Into<String>) -> Result<Self> {
        let file_name = file_name.into();
        validate_file_name(&file_name).map_err(|reason| {
            MemforgeError::invalid_artifact_id(format!("{run}/{file_name}"), reason)
        })?;
        Ok(Self { run, file_name })
    }

    /// Id of the artifact a stage writes for `run`.
    pub fn for_stage(run: RunId, stage: StageKind) -> Self {
        Self {
            run,
            file_name: stage.output_file_name().to_string(),
        }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Download path as exposed to clients (`/api/download/<run>/<file>`).
    pub fn download_path(&self) -> String {
        format!("{DOWNLOAD_ROUTE}/{self}")
    }
}

fn validate_file_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.contains("..") {
        return Err("relative path segments are not allowed");
    }
    if !FILE_NAME_RE.is_match(name) {
        return Err("file name must be a single plain path component");
    }
    Ok(())
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run, self.file_name)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = MemforgeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix(DOWNLOAD_ROUTE).unwrap_or(s);
        let s = s.strip_prefix('/').unwrap_or(s);

        let (run, file_name) = s
            .split_once('/')
            .ok_or_else(|| MemforgeError::invalid_artifact_id(s, "expected <run-id>/<file-name>"))?;

        let run: RunId = run
            .parse()
            .map_err(|e| MemforgeError::invalid_artifact_id(s, format!("bad run id: {e}")))?;

        Self::new(run, file_name)
    }
}

impl Serialize for ArtifactId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ArtifactSet
// ---------------------------------------------------------------------------

/// The two artifacts of a completed run. Only built once both stages succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub run_id: RunId,
    pub smart: ArtifactId,
    pub finetune: ArtifactId,
}

impl ArtifactSet {
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id,
            smart: ArtifactId::for_stage(run_id, StageKind::Smart),
            finetune: ArtifactId::for_stage(run_id, StageKind::Finetune),
        }
    }

    /// The response body clients receive after a successful upload.
    pub fn download_links(&self) -> DownloadLinks {
        DownloadLinks {
            smart: self.smart.download_path(),
            finetune: self.finetune.download_path(),
        }
    }
}

/// `{ "smart": <download-path>, "finetune": <download-path> }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLinks {
    pub smart: String,
    pub finetune: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_display_and_parse() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn empty_batch_rejected() {
        let err = UploadBatch::new(vec![]).unwrap_err();
        assert!(matches!(err, MemforgeError::Validation { .. }));
    }

    #[test]
    fn batch_preserves_order() {
        let batch = UploadBatch::new(vec![
            UploadFile::new("a.txt", "X"),
            UploadFile::new("b.txt", "Y"),
        ])
        .unwrap();
        let names: Vec<_> = batch.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(batch.total_bytes(), 2);
    }

    #[test]
    fn artifact_id_parses_download_path() {
        let run = RunId::new();
        let id = ArtifactId::for_stage(run, StageKind::Smart);
        let path = id.download_path();
        assert_eq!(path, format!("/api/download/{run}/memories.jsonl"));

        let parsed: ArtifactId = path.parse().unwrap();
        assert_eq!(parsed, id);
        let bare: ArtifactId = id.to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn artifact_id_rejects_traversal() {
        let run = RunId::new();
        for bad in [
            "../etc/passwd".to_string(),
            format!("{run}/../../etc/passwd"),
            format!("{run}/.."),
            format!("{run}/sub/file.jsonl"),
            format!("{run}/.hidden"),
            format!("{run}/"),
            "/etc/passwd".to_string(),
            "memories.jsonl".to_string(),
        ] {
            let err = bad.parse::<ArtifactId>().unwrap_err();
            assert!(
                matches!(err, MemforgeError::InvalidArtifactId { .. }),
                "expected InvalidArtifactId for {bad:?}, got {err}"
            );
        }
    }

    #[test]
    fn artifact_set_links_serialize() {
        let set = ArtifactSet::for_run(RunId::new());
        let json = serde_json::to_value(set.download_links()).unwrap();
        assert!(json["smart"].as_str().unwrap().ends_with("/memories.jsonl"));
        assert!(json["finetune"].as_str().unwrap().ends_with("/finetune_data.jsonl"));
    }

    #[test]
    fn artifact_id_serde_as_string() {
        let id = ArtifactId::for_stage(RunId::new(), StageKind::Finetune);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: ArtifactId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn stage_kind_names() {
        assert_eq!(StageKind::Smart.to_string(), "smart");
        assert_eq!(StageKind::Finetune.output_file_name(), "finetune_data.jsonl");
    }
}
