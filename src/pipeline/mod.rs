//! Pipeline stages and their collaborators.
//!
//! Each submodule owns exactly one concern so it can be tested on its own
//! and swapped (a different rasteriser, a different model backend) without
//! touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! scan ──▶ convert ──▶ (PNG files) ──▶ scan ──▶ extract ──▶ (TXT files)
//!            │  render + encode               │  service + postprocess
//!            ▼                                ▼
//!        checkpoint                         ledger
//! ```
//!
//! 1. [`scan`]: sorted, restartable enumeration of documents or images
//! 2. [`checkpoint`]: last converted page per document, replaced atomically
//! 3. [`render`]: the [`render::Rasterizer`] trait and its pdfium
//!    implementation; blocking, run inside `spawn_blocking`
//! 4. [`encode`]: PNG encoding and base64 for inline payloads
//! 5. [`convert`]: one document → page images, checkpoint per page
//! 6. [`service`]: the [`service::ExtractionService`] contract
//! 7. [`gemini`] / [`llm`]: the two service backends
//! 8. [`extract`]: one image → text file or ledger row; the single
//!    outcome classifier lives here
//! 9. [`ledger`]: append-only CSV of items that produced no text
//! 10. [`postprocess`]: text normalisation and corpus cleanup rules

pub mod checkpoint;
pub mod convert;
pub mod encode;
pub mod extract;
pub mod gemini;
pub mod ledger;
pub mod llm;
pub mod postprocess;
pub mod render;
pub mod scan;
pub mod service;
