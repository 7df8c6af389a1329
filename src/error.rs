//! Error types for the pdfocr library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the run cannot continue (corpus root
//!   unreadable, checkpoint or ledger corrupt, the extraction service is
//!   rate-limiting us). Returned as `Err(PipelineError)` from the driver and
//!   turned into a non-zero exit code by the binary.
//!
//! * [`ItemError`]: **Non-fatal**: one document or one page image failed
//!   (render glitch, upload refused, output not writable). Logged and counted
//!   in the [`crate::output::RunReport`]; the next run picks the item up again.
//!
//! Outcomes the extraction service *reports* (truncation, safety block, empty
//! answer, transient transport error) are neither: they are values of
//! [`crate::pipeline::extract::ExtractionOutcome`] and end up in the failure
//! ledger.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdfocr library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Corpus errors ─────────────────────────────────────────────────────
    /// The corpus root does not exist or cannot be read.
    #[error("Cannot read corpus root '{path}': {source}")]
    AccessError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Store errors ──────────────────────────────────────────────────────
    /// The checkpoint file exists but cannot be parsed.
    #[error(
        "Checkpoint '{path}' is corrupt: {detail}\n\
Inspect or remove the file by hand; it is never reset automatically."
    )]
    CorruptCheckpoint { path: PathBuf, detail: String },

    /// The checkpoint could not be read or atomically replaced.
    #[error("Failed to access checkpoint '{path}': {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The failure ledger exists but cannot be parsed.
    #[error("Failure ledger '{path}' is corrupt: {detail}")]
    CorruptLedger { path: PathBuf, detail: String },

    /// A ledger row could not be appended.
    #[error("Failed to append to failure ledger '{path}': {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Service errors ────────────────────────────────────────────────────
    /// The extraction service signalled rate limiting; the run stops here.
    #[error("Rate limit hit on '{service}': {detail}\nRe-run later; completed work is kept.")]
    RateLimited { service: String, detail: String },

    /// The extraction service is not initialised (missing API key etc.).
    #[error("Extraction service '{service}' is not configured.\n{hint}")]
    ServiceNotConfigured { service: String, hint: String },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium system-wide or set PDFIUM_LIB_PATH to the directory\n\
containing libpdfium (.so / .dylib / .dll)."
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cleanup rule could not be loaded or compiled.
    #[error("Invalid cleanup rule '{pattern}': {detail}")]
    CleanupRule { pattern: String, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// `true` for the error that means "stop hammering the endpoint".
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PipelineError::RateLimited { .. })
    }
}

/// A non-fatal error for a single work item.
///
/// Never escapes the per-item loop: the driver logs it, counts it, and
/// moves on to the next document or image.
#[derive(Debug, Error)]
pub enum ItemError {
    /// The page count of a document could not be determined.
    #[error("'{path}': cannot read page count: {detail}")]
    PageCount { path: PathBuf, detail: String },

    /// Rasterisation of one page failed.
    #[error("'{path}': rasterisation of page {page} failed: {detail}")]
    Render {
        path: PathBuf,
        page: usize,
        detail: String,
    },

    /// The image could not be registered with the extraction service.
    #[error("'{path}': upload failed: {detail}")]
    Upload { path: PathBuf, detail: String },

    /// An image or text output could not be written.
    #[error("Failed to write '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint could not be persisted after a page.
    #[error("'{path}': checkpoint not persisted: {detail}")]
    Checkpoint { path: PathBuf, detail: String },
}
