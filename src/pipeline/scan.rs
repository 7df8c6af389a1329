//! Corpus scanning: deterministic enumeration of work items under a root.
//!
//! Resuming from a checkpoint only works if every run sees the corpus in
//! the same order, so entries are sorted by file name within each directory
//! instead of trusting the filesystem's enumeration order. The scanner has
//! no side effects and each call to [`CorpusScanner::iter`] starts a fresh
//! walk, so the sequence can be restarted at will.

use crate::error::PipelineError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One discovered file: a source document or a page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Name of the containing folder (originating document group).
    pub group: String,
    /// 1-based page number when the file name ends in `_page_<n>`.
    pub ordinal: Option<usize>,
    /// Position in the scan, starting at 0.
    pub order: usize,
}

impl WorkItem {
    fn new(order: usize, path: PathBuf) -> Self {
        let group = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ordinal = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(page_ordinal);
        Self {
            path,
            group,
            ordinal,
            order,
        }
    }

    /// Path as shown in logs and stored in the checkpoint and ledger.
    pub fn display(&self) -> String {
        self.path.display().to_string()
    }
}

/// Parse the `<n>` of a `<stem>_page_<n>` file stem.
pub fn page_ordinal(stem: &str) -> Option<usize> {
    let (_, n) = stem.rsplit_once("_page_")?;
    n.parse().ok().filter(|&n| n >= 1)
}

/// Recursive, sorted enumeration of files with one extension.
#[derive(Debug, Clone)]
pub struct CorpusScanner {
    root: PathBuf,
    extension: String,
}

impl CorpusScanner {
    /// Create a scanner over `root` for files ending in `.extension`
    /// (case-insensitive).
    ///
    /// # Errors
    /// [`PipelineError::AccessError`] when the root does not exist, is not a
    /// directory, or cannot be resolved.
    pub fn new(root: impl AsRef<Path>, extension: &str) -> Result<Self, PipelineError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|source| PipelineError::AccessError {
                path: root.to_path_buf(),
                source,
            })?;
        if !canonical.is_dir() {
            return Err(PipelineError::AccessError {
                path: root.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    "corpus root is not a directory",
                ),
            });
        }
        // Probe readability now so an unreadable root is fatal up front
        // rather than a warning in the middle of the walk.
        std::fs::read_dir(&canonical).map_err(|source| PipelineError::AccessError {
            path: root.to_path_buf(),
            source,
        })?;

        Ok(Self {
            root: canonical,
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
        })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the corpus.
    ///
    /// Entries that cannot be read below the root are logged and skipped.
    pub fn iter(&self) -> impl Iterator<Item = WorkItem> + '_ {
        WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", self.root.display(), e);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| self.matches(e.path()))
            .enumerate()
            .map(|(order, e)| WorkItem::new(order, e.into_path()))
    }

    /// Collect the full scan into memory.
    pub fn collect(&self) -> Vec<WorkItem> {
        let items: Vec<WorkItem> = self.iter().collect();
        debug!(
            "Scanned {}: {} *.{} files",
            self.root.display(),
            items.len(),
            self.extension
        );
        items
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}
