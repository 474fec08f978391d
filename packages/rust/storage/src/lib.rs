//! Scratch store: the on-disk home of every pipeline run.
//!
//! The [`ScratchStore`] owns a single root directory. Each run gets its own
//! namespace below it:
//!
//! ```text
//! <root>/runs/<run-id>/
//! ├── uploads/<millis>-<i>-<name>  per-upload copies
//! ├── data.txt                    combined document
//! ├── memories.jsonl              smart dataset
//! ├── finetune_data.jsonl         fine-tune dataset
//! └── manifest.json
//! ```
//!
//! Nothing here is ever purged automatically; cleanup is left to operators.
//! Files are published with write-to-temp-then-rename so readers never see a
//! partial file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use memforge_shared::{
    ArtifactId, COMBINED_DOCUMENT_NAME, MemforgeError, Result, RunId, StageKind,
};

const RUNS_DIR_NAME: &str = "runs";
const UPLOADS_DIR_NAME: &str = "uploads";
const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Handle to the process-wide scratch directory.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    /// Open the store at `root`, creating it (and `runs/`) if absent.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let runs = root.join(RUNS_DIR_NAME);
        std::fs::create_dir_all(&runs).map_err(|e| MemforgeError::io(&runs, e))?;

        // Canonical root makes containment checks on resolved paths reliable.
        let root = std::fs::canonicalize(root).map_err(|e| MemforgeError::io(root, e))?;

        debug!(root = %root.display(), "scratch store ready");
        Ok(Self { root })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Namespace for `run`, without touching the filesystem.
    pub fn run_dir(&self, run: RunId) -> RunDir {
        RunDir {
            run_id: run,
            path: self.root.join(RUNS_DIR_NAME).join(run.to_string()),
        }
    }

    /// Create the namespace for a fresh run.
    pub fn create_run(&self, run: RunId) -> Result<RunDir> {
        let dir = self.run_dir(run);
        let uploads = dir.uploads_dir();
        std::fs::create_dir_all(&uploads).map_err(|e| MemforgeError::io(&uploads, e))?;

        info!(%run, path = %dir.path.display(), "run namespace created");
        Ok(dir)
    }

    /// Path an artifact id refers to. The id is pre-validated, so the result
    /// always lies inside the run namespace it names.
    pub fn resolve(&self, id: &ArtifactId) -> PathBuf {
        self.run_dir(id.run()).path.join(id.file_name())
    }
}

/// One run's namespace inside the scratch store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    run_id: RunId,
    path: PathBuf,
}

impl RunDir {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.path.join(UPLOADS_DIR_NAME)
    }

    pub fn combined_document(&self) -> PathBuf {
        self.path.join(COMBINED_DOCUMENT_NAME)
    }

    /// Where `stage` is told to write its output.
    pub fn stage_output(&self, stage: StageKind) -> PathBuf {
        self.path.join(stage.output_file_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }

    /// Path for the retained copy of the `index`-th upload: `<millis>-<index>-<name>`.
    pub fn upload_copy_path(&self, index: usize, original_name: &str) -> PathBuf {
        let millis = chrono::Utc::now().timestamp_millis();
        self.uploads_dir()
            .join(format!("{millis}-{index}-{}", sanitize_upload_name(original_name)))
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// A file written under a temporary name and renamed into place on commit.
///
/// Dropping without [`AtomicFile::commit`] leaves only the hidden temp file;
/// the target path never holds partial content.
pub struct AtomicFile {
    target: PathBuf,
    temp: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicFile {
    pub fn create(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        let temp = temp_path_for(&target)?;
        let file = File::create(&temp).map_err(|e| MemforgeError::io(&temp, e))?;

        Ok(Self {
            target,
            temp,
            writer: BufWriter::new(file),
        })
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| MemforgeError::io(&self.temp, e))
    }

    /// Flush, fsync, close, and rename onto the target. Returns the target path.
    pub fn commit(self) -> Result<PathBuf> {
        let Self {
            target,
            temp,
            writer,
        } = self;

        let file = writer
            .into_inner()
            .map_err(|e| MemforgeError::io(&temp, e.into_error()))?;
        file.sync_all().map_err(|e| MemforgeError::io(&temp, e))?;
        drop(file);

        std::fs::rename(&temp, &target).map_err(|e| MemforgeError::io(&target, e))?;
        debug!(path = %target.display(), "committed file");
        Ok(target)
    }
}

/// Write `content` to `path` atomically (write to temp, then rename).
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = AtomicFile::create(path)?;
    file.write_all(content)?;
    file.commit()?;
    Ok(())
}

fn temp_path_for(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            MemforgeError::validation(format!("not a file path: {}", target.display()))
        })?;
    Ok(target.with_file_name(format!(".{name}.tmp")))
}

// ---------------------------------------------------------------------------
// Upload names
// ---------------------------------------------------------------------------

/// Reduce a client-supplied file name to a safe single path component.
pub fn sanitize_upload_name(name: &str) -> String {
    static UNSAFE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));

    // Keep only the final component of whatever path the client sent.
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = UNSAFE_RE.replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
