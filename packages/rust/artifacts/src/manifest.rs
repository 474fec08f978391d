//! Run manifest: what a completed run consumed and produced.

use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use memforge_shared::{ArtifactId, CURRENT_SCHEMA_VERSION, MemforgeError, Result, RunId};
use memforge_storage::{RunDir, ScratchStore, write_atomic};

/// The `manifest.json` written at the root of a completed run namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Original upload names, in batch order.
    pub uploads: Vec<String>,
    pub artifacts: Vec<ArtifactMeta>,
}

impl RunManifest {
    pub fn new(
        run_id: RunId,
        created_at: DateTime<Utc>,
        uploads: Vec<String>,
        artifacts: Vec<ArtifactMeta>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id,
            created_at,
            completed_at: Utc::now(),
            uploads,
            artifacts,
        }
    }
}

/// Metadata for a single artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    /// Non-empty lines, i.e. records in a line-delimited dataset.
    pub record_count: usize,
}

/// Checksum and count records of an artifact already on disk.
pub fn describe_artifact(store: &ScratchStore, id: &ArtifactId) -> Result<ArtifactMeta> {
    let path = store.resolve(id);
    let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MemforgeError::NotFound { id: id.to_string() },
        _ => MemforgeError::io(&path, e),
    })?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut record_count = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| MemforgeError::io(&path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&line);
        size_bytes += n as u64;
        if line.iter().any(|b| !b.is_ascii_whitespace()) {
            record_count += 1;
        }
    }

    Ok(ArtifactMeta {
        id: id.clone(),
        file_name: id.file_name().to_string(),
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes,
        record_count,
    })
}

/// Write `manifest.json` into the run namespace (atomically, pretty-printed).
#[instrument(skip_all, fields(run_id = %manifest.run_id))]
pub fn write_manifest(run_dir: &RunDir, manifest: &RunManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| {
        MemforgeError::validation(format!("JSON serialization failed: {e}"))
    })?;
    let path = run_dir.manifest_path();
    write_atomic(&path, &json)?;
    debug!(path = %path.display(), artifacts = manifest.artifacts.len(), "wrote run manifest");
    Ok(())
}

/// Read back a run's manifest.
pub fn load_manifest(run_dir: &RunDir) -> Result<RunManifest> {
    read_manifest(&run_dir.manifest_path())
}

fn read_manifest(path: &Path) -> Result<RunManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| MemforgeError::io(path, e))?;
    let manifest: RunManifest = serde_json::from_str(&content)
        .map_err(|e| MemforgeError::validation(format!("invalid manifest.json: {e}")))?;

    if manifest.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(MemforgeError::validation(format!(
            "unsupported schema_version: {} (expected {})",
            manifest.schema_version, CURRENT_SCHEMA_VERSION
        )));
    }
    Ok(manifest)
}
