//! Run results and output-file writing.

use crate::config::RunMode;
use crate::error::ItemError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Counters for the conversion stage (unit: documents, plus page totals).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    /// Documents found under the corpus root.
    pub discovered: usize,
    /// Documents that had at least one page materialised this run.
    pub processed: usize,
    /// Documents already complete according to the checkpoint.
    pub skipped: usize,
    /// Documents aborted by an item error.
    pub failed: usize,
    /// Page images rendered and written.
    pub pages_written: usize,
    /// Pages found on disk and only recorded in the checkpoint.
    pub pages_reused: usize,
}

/// Counters for the extraction stage (unit: page images).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub discovered: usize,
    /// Text files written.
    pub processed: usize,
    /// Skipped because the text output already existed.
    pub skipped_existing: usize,
    /// Skipped because the image is in the failure ledger.
    pub skipped_ledger: usize,
    /// Ledger rows appended this run, by reason category.
    pub ledgered: BTreeMap<String, usize>,
    /// Item errors (upload refused, output not writable); retried next run.
    pub failed: usize,
}

impl ExtractionStats {
    pub fn skipped(&self) -> usize {
        self.skipped_existing + self.skipped_ledger
    }

    pub fn ledgered_total(&self) -> usize {
        self.ledgered.values().sum()
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionStats>,
    pub duration_ms: u64,
}

/// Per-pattern result of a cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternCount {
    pub pattern: String,
    pub matches: usize,
}

/// Result of a cleanup pass over the text corpus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub files_scanned: usize,
    pub files_changed: usize,
    pub files_failed: usize,
    pub dry_run: bool,
    /// In rule order.
    pub patterns: Vec<PatternCount>,
}

/// Write `bytes` to `path` through a sibling temp file and a rename, creating
/// parent directories as needed.
///
/// A reader never observes a partially written output; a crash leaves at
/// most a stray `*.tmp` file that the scanners ignore.
pub async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), ItemError> {
    let write_err = |source| ItemError::OutputWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
