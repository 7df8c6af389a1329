//! Progress-callback trait for per-item pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the driver works through documents and page images.
//!
//! Callers can forward events to a terminal progress bar, a log file, or a
//! channel without the library knowing how the host application reports
//! progress. The pipeline is sequential, so events for one stage always
//! arrive in order.
//!
//! # Example
//!
//! ```rust
//! use pdfocr::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_item_complete(&self, stage: Stage, item: &str, _detail: &str) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: {item} done ({n} so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Pipeline stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// PDF → page images.
    Convert,
    /// Page images → text.
    Extract,
    /// Regex cleanup over the text corpus.
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Convert => write!(f, "convert"),
            Stage::Extract => write!(f, "extract"),
            Stage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Called by the driver as it processes each item.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `item` is the display path of the document or image.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once per stage before the first item.
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let _ = (stage, total_items);
    }

    /// Called just before an item is worked on (not for skipped items).
    fn on_item_start(&self, stage: Stage, item: &str) {
        let _ = (stage, item);
    }

    /// Called when an item produced its output.
    fn on_item_complete(&self, stage: Stage, item: &str, detail: &str) {
        let _ = (stage, item, detail);
    }

    /// Called when an item was skipped by an idempotence guard.
    fn on_item_skipped(&self, stage: Stage, item: &str, reason: &str) {
        let _ = (stage, item, reason);
    }

    /// Called when an item failed (item error or ledger outcome).
    fn on_item_error(&self, stage: Stage, item: &str, error: &str) {
        let _ = (stage, item, error);
    }

    /// Called once per stage after the last item.
    fn on_stage_complete(&self, stage: Stage, processed: usize, failed: usize) {
        let _ = (stage, processed, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
