//! PDF rasterisation collaborator: page count and single-page rendering.
//!
//! The conversion stage only ever needs two things from a PDF library (how
//! many pages a document has, and one page as an image) so that is the
//! whole [`Rasterizer`] trait. [`PdfiumRasterizer`] implements it with
//! pdfium; tests substitute a fake.
//!
//! ## Why one page per call?
//!
//! Rendering a whole 400-page scan up front would hold every bitmap in memory
//! at once. Loading the document and rendering exactly one page per call keeps
//! peak memory at one page regardless of document length, at the cost of
//! re-opening the file per page (cheap next to the render itself).
//!
//! ## Why cap pixels, not DPI?
//!
//! Scanned page sizes vary wildly. `max_rendered_pixels` caps the longest
//! edge regardless of physical size, keeping memory bounded and the image
//! within what vision APIs accept.
//!
//! Pdfium is blocking and not async-safe; callers run these methods inside
//! `tokio::task::spawn_blocking`.

use crate::error::PipelineError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Failure reported by a rasterisation collaborator.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RenderError(pub String);

/// Page-count query and single-page rendering for one document format.
pub trait Rasterizer: Send + Sync {
    /// Total number of pages in `doc`.
    fn page_count(&self, doc: &Path) -> Result<usize, RenderError>;

    /// Render the 1-based `page_number` of `doc`.
    fn render_page(&self, doc: &Path, page_number: usize) -> Result<DynamicImage, RenderError>;
}

/// [`Rasterizer`] backed by the pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    library_dir: Option<PathBuf>,
    max_pixels: u32,
}

impl PdfiumRasterizer {
    /// Create a rasteriser, verifying that pdfium can be bound.
    ///
    /// `library_dir` is the directory holding the platform pdfium library;
    /// `None` binds the system-wide library.
    pub fn new(library_dir: Option<PathBuf>, max_pixels: u32) -> Result<Self, PipelineError> {
        let rasterizer = Self {
            library_dir,
            max_pixels,
        };
        rasterizer
            .bind()
            .map_err(|e| PipelineError::PdfiumBindingFailed(e.0))?;
        Ok(rasterizer)
    }

    fn bind(&self) -> Result<Pdfium, RenderError> {
        let bindings = match &self.library_dir {
            Some(dir) => {
                let lib = Pdfium::pdfium_platform_library_name_at_path(dir);
                Pdfium::bind_to_library(&lib)
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| RenderError(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn page_count(&self, doc: &Path) -> Result<usize, RenderError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(doc, None)
            .map_err(|e| RenderError(format!("cannot open PDF: {e:?}")))?;
        let total = document.pages().len() as usize;
        debug!("{}: {} pages", doc.display(), total);
        Ok(total)
    }

    fn render_page(&self, doc: &Path, page_number: usize) -> Result<DynamicImage, RenderError> {
        if page_number == 0 {
            return Err(RenderError("page numbers are 1-based".into()));
        }

        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(doc, None)
            .map_err(|e| RenderError(format!("cannot open PDF: {e:?}")))?;

        let pages = document.pages();
        let total = pages.len() as usize;
        if page_number > total {
            return Err(RenderError(format!(
                "page {page_number} out of range (document has {total} pages)"
            )));
        }

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let page = pages
            .get((page_number - 1) as u16)
            .map_err(|e| RenderError(format!("{e:?}")))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError(format!("{e:?}")))?;

        let image = bitmap.as_image();
        debug!(
            "Rendered {} page {} → {}x{} px",
            doc.display(),
            page_number,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}
