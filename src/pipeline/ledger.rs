//! Failure ledger: append-only log of items that produced no usable text.
//!
//! A headerless two-column CSV, `path,reason`, one row per failed attempt.
//! Rows are only ever appended, never rewritten or deduplicated, and the
//! whole file is read into a map at startup. An item present in the map is
//! never resubmitted; deleting its row (or the file) by hand is the only way
//! to retry it.

use crate::error::PipelineError;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub path: String,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// In-memory view of the ledger keyed by item path.
///
/// When an item appears more than once the last reason wins.
#[derive(Debug, Clone, Default)]
pub struct LedgerIndex {
    entries: HashMap<String, String>,
    rows: usize,
}

impl LedgerIndex {
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn reason(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Distinct items in the ledger.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw row count, duplicates included.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Record a row appended during this run so later checks see it.
    pub fn insert(&mut self, record: &FailureRecord) {
        self.entries
            .insert(record.path.clone(), record.reason.clone());
        self.rows += 1;
    }

    /// Distinct items per reason category (see [`reason_category`]).
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut out = BTreeMap::new();
        for reason in self.entries.values() {
            *out.entry(reason_category(reason)).or_insert(0) += 1;
        }
        out
    }
}

/// Bucket a free-form reason string by its leading token.
pub fn reason_category(reason: &str) -> &'static str {
    const CATEGORIES: [&str; 5] = ["MAX_TOKENS", "SAFETY", "RECITATION", "NO_CANDIDATES", "ERROR"];
    let head = reason.trim_start();
    CATEGORIES
        .into_iter()
        .find(|c| head.starts_with(c))
        .unwrap_or("OTHER")
}

/// Owner of the ledger file.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    path: PathBuf,
}

impl FailureLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every row into a [`LedgerIndex`]; an absent file is an empty ledger.
    ///
    /// Rows may have a missing reason column (read as empty). Anything the CSV
    /// reader rejects is reported as [`PipelineError::CorruptLedger`].
    pub fn load(&self) -> Result<LedgerIndex, PipelineError> {
        if !self.path.exists() {
            debug!("No failure ledger at {}", self.path.display());
            return Ok(LedgerIndex::default());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.corrupt(e))?;

        let mut index = LedgerIndex::default();
        for row in reader.records() {
            let row = row.map_err(|e| self.corrupt(e))?;
            let Some(path) = row.get(0).filter(|p| !p.is_empty()) else {
                continue;
            };
            index.insert(&FailureRecord::new(path, row.get(1).unwrap_or("")));
        }

        info!(
            "Loaded failure ledger {} ({} items, {} rows)",
            self.path.display(),
            index.len(),
            index.rows()
        );
        Ok(index)
    }

    /// Append one row and flush it to disk before returning.
    pub fn append(&self, record: &FailureRecord) -> Result<(), PipelineError> {
        let write_err = |source| PipelineError::LedgerWrite {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record([record.path.as_str(), record.reason.as_str()])
            .map_err(|e| write_err(std::io::Error::other(e.to_string())))?;
        writer.flush().map_err(write_err)?;

        let file = writer
            .into_inner()
            .map_err(|e| write_err(std::io::Error::other(e.to_string())))?;
        file.sync_data().map_err(write_err)?;

        debug!("Ledger += {} ({})", record.path, record.reason);
        Ok(())
    }

    fn corrupt(&self, e: csv::Error) -> PipelineError {
        PipelineError::CorruptLedger {
            path: self.path.clone(),
            detail: e.to_string(),
        }
    }
}
