//! Artifact retriever: artifact id → byte stream.

use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info, instrument, warn};

use memforge_shared::{ArtifactId, MemforgeError, Result};
use memforge_storage::ScratchStore;

/// Number of lines the upload UI shows when previewing an artifact.
pub const DEFAULT_PREVIEW_LINES: usize = 10;

/// Read-side view of the scratch store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    store: ScratchStore,
}

/// An opened artifact, ready to be streamed to a client.
#[derive(Debug)]
pub struct ArtifactStream {
    id: ArtifactId,
    path: PathBuf,
    len: u64,
    file: File,
}

impl ArtifactStream {
    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Size in bytes at the time the artifact was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `Content-Disposition` value for serving the artifact as a download.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.id.file_name())
    }

    /// The underlying async reader.
    pub fn into_reader(self) -> File {
        self.file
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file
            .read_to_end(&mut buf)
            .await
            .map_err(|e| MemforgeError::io(&self.path, e))?;
        Ok(buf)
    }
}

impl ArtifactStore {
    pub fn new(store: ScratchStore) -> Self {
        Self { store }
    }

    /// Open an artifact for streaming.
    ///
    /// Returns [`MemforgeError::NotFound`] when nothing exists at the resolved
    /// path; any other filesystem problem is an [`MemforgeError::Io`].
    #[instrument(skip_all, fields(artifact = %id))]
    pub async fn retrieve(&self, id: &ArtifactId) -> Result<ArtifactStream> {
        let path = self.store.resolve(id);

        let canonical = match tokio::fs::canonicalize(&path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "artifact missing");
                return Err(MemforgeError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(MemforgeError::io(&path, e)),
        };

        // A symlink inside a run directory must not lead out of the store.
        if !canonical.starts_with(self.store.root()) {
            warn!(path = %canonical.display(), "artifact resolves outside scratch store");
            return Err(MemforgeError::invalid_artifact_id(
                id.to_string(),
                "resolves outside the scratch store",
            ));
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| MemforgeError::io(&canonical, e))?;
        if !metadata.is_file() {
            return Err(MemforgeError::NotFound { id: id.to_string() });
        }

        let file = File::open(&canonical)
            .await
            .map_err(|e| MemforgeError::io(&canonical, e))?;

        info!(size = metadata.len(), "artifact opened for download");

        Ok(ArtifactStream {
            id: id.clone(),
            path: canonical,
            len: metadata.len(),
            file,
        })
    }

    /// Read an artifact fully into memory.
    pub async fn read_all(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        self.retrieve(id).await?.read_to_end().await
    }

    /// First `max_lines` non-empty records of a line-delimited artifact.
    ///
    /// Blank lines are skipped, so this can reach further into the file than
    /// the upload page's preview, which shows the first `max_lines` raw lines
    /// (blank ones included).
    pub async fn preview(&self, id: &ArtifactId, max_lines: usize) -> Result<Vec<String>> {
        let stream = self.retrieve(id).await?;
        let path = stream.path.clone();
        let mut lines = BufReader::new(stream.into_reader()).lines();

        let mut records = Vec::with_capacity(max_lines);
        while records.len() < max_lines {
            match lines
                .next_line()
                .await
                .map_err(|e| MemforgeError::io(&path, e))?
            {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => records.push(line),
                None => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memforge_shared::{RunId, StageKind};
    use uuid::Uuid;

    fn temp_store() -> (PathBuf, ScratchStore) {
        let dir = std::env::temp_dir().join(format!("mf-retriever-test-{}", Uuid::now_v7()));
        let store = ScratchStore::open(&dir).unwrap();
        (dir, store)
    }

    fn seed(store: &ScratchStore, stage: StageKind, content: &str) -> ArtifactId {
        let run = store.create_run(RunId::new()).unwrap();
        std::fs::write(run.stage_output(stage), content).unwrap();
        ArtifactId::for_stage(run.run_id(), stage)
    }

    #[tokio::test]
    async fn retrieve_returns_bytes() {
        let (tmp, store) = temp_store();
        let id = seed(&store, StageKind::Smart, "{\"a\":1}\n");
        let artifacts = ArtifactStore::new(store);

        let stream = artifacts.retrieve(&id).await.unwrap();
        assert_eq!(stream.len(), 8);
        assert_eq!(
            stream.content_disposition(),
            "attachment; filename=\"memories.jsonl\""
        );
        assert_eq!(stream.read_to_end().await.unwrap(), b"{\"a\":1}\n");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn retrieve_is_idempotent() {
        let (tmp, store) = temp_store();
        let id = seed(&store, StageKind::Finetune, "line one\nline two\n");
        let artifacts = ArtifactStore::new(store);

        let first = artifacts.read_all(&id).await.unwrap();
        let second = artifacts.read_all(&id).await.unwrap();
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn never_produced_is_not_found() {
        let (tmp, store) = temp_store();
        let artifacts = ArtifactStore::new(store);
        let id = ArtifactId::for_stage(RunId::new(), StageKind::Smart);

        let err = artifacts.retrieve(&id).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn directory_is_not_an_artifact() {
        let (tmp, store) = temp_store();
        let run = store.create_run(RunId::new()).unwrap();
        let id = ArtifactId::new(run.run_id(), "uploads").unwrap();
        let artifacts = ArtifactStore::new(store);

        let err = artifacts.retrieve(&id).await.unwrap_err();
        assert!(err.is_not_found());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_store_rejected() {
        let (tmp, store) = temp_store();
        let outside = std::env::temp_dir().join(format!("mf-outside-{}", Uuid::now_v7()));
        std::fs::write(&outside, "secret").unwrap();

        let run = store.create_run(RunId::new()).unwrap();
        std::os::unix::fs::symlink(&outside, run.path().join("leak.jsonl")).unwrap();
        let id = ArtifactId::new(run.run_id(), "leak.jsonl").unwrap();
        let artifacts = ArtifactStore::new(store);

        let err = artifacts.retrieve(&id).await.unwrap_err();
        assert!(matches!(err, MemforgeError::InvalidArtifactId { .. }));

        let _ = std::fs::remove_file(&outside);
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn preview_skips_blank_lines_and_caps() {
        let (tmp, store) = temp_store();
        let content: String = (0..25).map(|i| format!("{{\"n\":{i}}}\n\n")).collect();
        let id = seed(&store, StageKind::Smart, &content);
        let artifacts = ArtifactStore::new(store);

        let lines = artifacts.preview(&id, DEFAULT_PREVIEW_LINES).await.unwrap();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "{\"n\":0}");
        assert_eq!(lines[9], "{\"n\":9}");

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
