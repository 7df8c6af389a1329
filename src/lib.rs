//! # pdfocr
//!
//! Resumable batch OCR for large scanned-PDF archives: rasterise every page to
//! PNG, transcribe each page image with a vision language model, and keep
//! going across crashes, quota exhaustion, and refusals without losing or
//! repeating work.
//!
//! ## Why this crate?
//!
//! Transcribing a few hundred thousand pages takes days and is interrupted
//! constantly: the machine reboots, the API quota runs out, a page trips a
//! safety filter. Every stage here is idempotent. The conversion stage keeps a
//! per-document checkpoint written after every page; the extraction stage
//! skips any page that already has a text file or is recorded in the failure
//! ledger. Re-running the same command is always safe and only does the work
//! that is left.
//!
//! ## Pipeline Overview
//!
//! ```text
//! pdf_root/**/*.pdf
//!  │
//!  ├─ 1. Scan     sorted recursive walk (deterministic order for resume)
//!  ├─ 2. Convert  pdfium renders one page at a time → image_root/<subdirs>/<stem>_page_<n>.png
//!  │              checkpoint advanced after every page
//!  ├─ 3. Extract  upload → generate → release, outcome classified once
//!  │              Success → text_root/…/<stem>_page_<n>.txt
//!  │              MAX_TOKENS / SAFETY / NO_CANDIDATES / ERROR → failure ledger
//!  │              rate limit → stop the run, exit 1
//!  └─ 4. Report   per-stage counters (RunReport)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfocr::{ExtractionConfig, GeminiService, Pipeline, PipelineConfig, RunMode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .pdf_root("archive/")
//!         .image_root("out/images")
//!         .text_root("out/text")
//!         .build()?;
//!     let extraction = ExtractionConfig::builder()
//!         .api_key(std::env::var("GEMINI_API_KEY")?)
//!         .build()?;
//!
//!     let report = Pipeline::new(config)
//!         .with_extraction(Arc::new(GeminiService::new(&extraction)?), &extraction)
//!         .run(RunMode::All)
//!         .await?;
//!     eprintln!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdfocr = { version = "0.1", default-features = false }
//! ```
//!
//! ## Extraction Backends
//!
//! | Backend | Upload | Truncation signal |
//! |---------|--------|-------------------|
//! | [`GeminiService`] | Gemini Files API, deleted after each page | `finishReason: MAX_TOKENS` |
//! | [`LlmProviderService`] | inline base64 image | output used the whole token budget |
//!
//! Anything else can be plugged in by implementing [`ExtractionService`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod driver;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, PipelineConfig, PipelineConfigBuilder, RunMode};
pub use driver::{purge_uploads, Pipeline, PurgeReport, RunPhase};
pub use error::{ItemError, PipelineError};
pub use output::{CleanupReport, ConversionStats, ExtractionStats, PatternCount, RunReport};
pub use pipeline::extract::{classify, ExtractionOutcome};
pub use pipeline::gemini::GeminiService;
pub use pipeline::llm::LlmProviderService;
pub use pipeline::postprocess::{CleanupRule, CleanupRules};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer, RenderError};
pub use pipeline::service::{
    Candidate, ExtractionService, FinishIndicator, RemoteFile, RemoteUpload, ServiceError,
    ServiceErrorKind, ServiceResponse, UsageMetadata,
};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
