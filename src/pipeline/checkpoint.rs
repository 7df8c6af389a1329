//! Checkpoint store: durable "last converted page" per document.
//!
//! The on-disk form is a single JSON object mapping document path to the
//! 1-based number of the last page whose image is known to be on disk:
//!
//! ```json
//! {"/corpus/box1/letters.pdf": 7, "/corpus/box2/deeds.pdf": 2}
//! ```
//!
//! Invariant: every page `<=` the stored value is materialised; pages beyond
//! it are not assumed to exist. Values never decrease.
//!
//! The whole map is rewritten after every page through a temp file in the
//! same directory followed by a rename, so a crash mid-save leaves either
//! the old or the new file, never a truncated one. A file that exists but
//! does not parse is a hard error: silently starting from zero would mean
//! quietly redoing (or worse, losing track of) thousands of pages.

use crate::error::PipelineError;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// In-memory checkpoint: document path → last fully converted page (1-based).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pages: BTreeMap<String, usize>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last converted page of `doc`, or 0 when nothing is recorded.
    ///
    /// Also the 0-based index of the first page still to convert.
    pub fn get(&self, doc: &str) -> usize {
        self.pages.get(doc).copied().unwrap_or(0)
    }

    /// Record that pages `1..=page` of `doc` are on disk.
    ///
    /// Returns `true` when the stored value changed. A lower value than the
    /// one already stored is ignored.
    pub fn advance(&mut self, doc: &str, page: usize) -> bool {
        let entry = self.pages.entry(doc.to_string()).or_insert(0);
        if page > *entry {
            *entry = page;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.pages.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Owner of the checkpoint file; the only code that reads or writes it.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint; an absent file is an empty checkpoint.
    ///
    /// # Errors
    /// [`PipelineError::CorruptCheckpoint`] if the file exists but is not a
    /// JSON object of non-negative integers; [`PipelineError::CheckpointIo`]
    /// if it cannot be read.
    pub fn load(&self) -> Result<Checkpoint, PipelineError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No checkpoint at {}, starting fresh", self.path.display());
                return Ok(Checkpoint::new());
            }
            Err(source) => {
                return Err(PipelineError::CheckpointIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let pages: BTreeMap<String, usize> =
            serde_json::from_str(&raw).map_err(|e| PipelineError::CorruptCheckpoint {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;

        info!(
            "Loaded checkpoint {} ({} documents)",
            self.path.display(),
            pages.len()
        );
        Ok(Checkpoint { pages })
    }

    /// Atomically replace the checkpoint file with `checkpoint`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let io_err = |source| PipelineError::CheckpointIo {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let json = serde_json::to_vec(&checkpoint.pages)
            .map_err(|e| PipelineError::Internal(format!("checkpoint serialise: {e}")))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("Checkpoint saved ({} documents)", checkpoint.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn absent_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested/cp.json"));
        let mut cp = Checkpoint::new();
        cp.advance("/c/a.pdf", 3);
        cp.advance("/c/b.pdf", 1);
        store.save(&cp).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.get("/c/a.pdf"), 3);
        assert_eq!(loaded.get("/c/unknown.pdf"), 0);
    }

    #[test]
    fn advance_never_decreases() {
        let mut cp = Checkpoint::new();
        assert!(cp.advance("d", 4));
        assert!(!cp.advance("d", 2));
        assert!(!cp.advance("d", 4));
        assert_eq!(cp.get("d"), 4);
        assert!(cp.advance("d", 5));
        assert_eq!(cp.get("d"), 5);
    }

    #[test]
    fn corrupt_file_is_fatal_and_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{\"a.pdf\": 3,").unwrap();
        let store = CheckpointStore::new(&path);

        let err = store.load().unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a.pdf\": 3,");
    }

    #[test]
    fn negative_page_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, r#"{"a.pdf": -1}"#).unwrap();
        let err = CheckpointStore::new(&path).load().unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        let mut cp = Checkpoint::new();
        for page in 1..=5 {
            cp.advance("doc.pdf", page);
            store.save(&cp).unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.load().unwrap().get("doc.pdf"), 5);
    }
}
