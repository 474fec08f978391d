//! Intake aggregator: upload batch → combined document.
//!
//! Every upload is kept as a copy under the run's `uploads/` directory, then
//! the decoded texts are concatenated (each followed by a blank line) into
//! `data.txt`. The combined document is published by rename, so it is either
//! absent or complete when a stage opens it.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use memforge_shared::{DecodePolicy, MemforgeError, Result, UploadBatch, UploadFile};
use memforge_storage::{AtomicFile, RunDir};

/// Written after every upload's text.
pub const DOCUMENT_SEPARATOR: &str = "\n\n";

/// The combined document, fully written and closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedDocument {
    pub path: PathBuf,
    pub size_bytes: usize,
    pub file_count: usize,
}

impl CombinedDocument {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Build the combined document for `batch` inside `run_dir`.
#[instrument(skip_all, fields(run_id = %run_dir.run_id(), files = batch.len()))]
pub fn aggregate(
    run_dir: &RunDir,
    batch: &UploadBatch,
    policy: DecodePolicy,
) -> Result<CombinedDocument> {
    for (index, file) in batch.files().iter().enumerate() {
        let copy = run_dir.upload_copy_path(index, &file.name);
        std::fs::write(&copy, &file.content).map_err(|e| MemforgeError::io(&copy, e))?;
        debug!(name = %file.name, path = %copy.display(), "stored upload copy");
    }

    // Decode everything up front so a rejected upload never leaves a
    // half-built combined document behind.
    let texts = batch
        .files()
        .iter()
        .map(|file| decode(file, policy))
        .collect::<Result<Vec<_>>>()?;

    let mut out = AtomicFile::create(run_dir.combined_document())?;
    let mut size_bytes = 0;
    for text in &texts {
        out.write_all(text.as_bytes())?;
        out.write_all(DOCUMENT_SEPARATOR.as_bytes())?;
        size_bytes += text.len() + DOCUMENT_SEPARATOR.len();
    }
    let path = out.commit()?;

    info!(path = %path.display(), size_bytes, "combined document written");

    Ok(CombinedDocument {
        path,
        size_bytes,
        file_count: texts.len(),
    })
}

fn decode(file: &UploadFile, policy: DecodePolicy) -> Result<Cow<'_, str>> {
    match std::str::from_utf8(&file.content) {
        Ok(text) => Ok(Cow::Borrowed(text)),
        Err(e) => match policy {
            DecodePolicy::Reject => Err(MemforgeError::Decode {
                name: file.name.clone(),
            }),
            DecodePolicy::Lossy => {
                warn!(name = %file.name, error = %e, "upload is not valid UTF-8, replacing invalid bytes");
                Ok(String::from_utf8_lossy(&file.content))
            }
        },
    }
}
