//! Conversion stage: one PDF → one PNG per page, checkpointed per page.
//!
//! Pages are handled strictly one at a time. For each page the stage
//! renders, encodes, writes the image atomically, and only then advances and
//! persists the checkpoint, so the checkpoint never claims a page that is not
//! on disk. An image that already exists (from a run killed between the write
//! and the checkpoint save) is not rendered again; the checkpoint just
//! catches up.

use crate::config::PipelineConfig;
use crate::error::ItemError;
use crate::output::write_output;
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::encode::encode_png;
use crate::pipeline::render::{Rasterizer, RenderError};
use crate::pipeline::scan::WorkItem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of converting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentDisposition {
    /// Remaining pages were materialised.
    Converted {
        total_pages: usize,
        pages_written: usize,
        pages_reused: usize,
    },
    /// The checkpoint already covers every page.
    UpToDate { total_pages: usize },
    /// Aborted; pages before the failure stay recorded.
    Failed {
        error: String,
        pages_written: usize,
        pages_reused: usize,
    },
}

/// Image path for page `page_number` of `doc`:
/// `<image_root>/<folders below pdf_root>/<stem>_page_<n>.<ext>`.
///
/// The image tree mirrors the PDF tree, so two documents can only share an
/// image path if they share a directory and a stem. A document outside
/// `pdf_root` falls back to its parent folder name.
pub fn page_image_path(config: &PipelineConfig, doc: &WorkItem, page_number: usize) -> PathBuf {
    let stem = doc
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let folder = doc
        .path
        .parent()
        .and_then(|dir| dir.strip_prefix(&config.pdf_root).ok())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&doc.group));
    config
        .image_root
        .join(folder)
        .join(format!("{stem}_page_{page_number}.{}", config.image_extension))
}

/// Per-document worker for the conversion stage.
pub struct ConversionStage {
    rasterizer: Arc<dyn Rasterizer>,
    store: CheckpointStore,
}

impl ConversionStage {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, store: CheckpointStore) -> Self {
        Self { rasterizer, store }
    }

    /// Convert every page of `doc` beyond its checkpoint.
    ///
    /// Never fails the run: any error ends this document and is returned as
    /// [`DocumentDisposition::Failed`].
    pub async fn convert_document(
        &self,
        config: &PipelineConfig,
        doc: &WorkItem,
        checkpoint: &mut Checkpoint,
    ) -> DocumentDisposition {
        let key = doc.display();
        let mut written = 0;
        let mut reused = 0;

        let result = self
            .convert_pages(config, doc, &key, checkpoint, &mut written, &mut reused)
            .await;

        match result {
            Ok(total_pages) if written == 0 && reused == 0 => {
                debug!("{}: all {} pages already converted", key, total_pages);
                DocumentDisposition::UpToDate { total_pages }
            }
            Ok(total_pages) => {
                info!(
                    "Converted {} ({} pages, {} rendered, {} already on disk)",
                    key, total_pages, written, reused
                );
                DocumentDisposition::Converted {
                    total_pages,
                    pages_written: written,
                    pages_reused: reused,
                }
            }
            Err(err) => {
                warn!("{}", err);
                DocumentDisposition::Failed {
                    error: err.to_string(),
                    pages_written: written,
                    pages_reused: reused,
                }
            }
        }
    }

    async fn convert_pages(
        &self,
        config: &PipelineConfig,
        doc: &WorkItem,
        key: &str,
        checkpoint: &mut Checkpoint,
        written: &mut usize,
        reused: &mut usize,
    ) -> Result<usize, ItemError> {
        let total = self.page_count(&doc.path).await?;
        let start = checkpoint.get(key);
        if start >= total {
            return Ok(total);
        }
        info!("Converting {} from page {} of {}", key, start + 1, total);

        for index in start..total {
            let page_number = index + 1;
            let image_path = page_image_path(config, doc, page_number);

            if image_path.exists() {
                debug!("{} exists, skipping render", image_path.display());
                *reused += 1;
            } else {
                self.render_to(&doc.path, page_number, &image_path).await?;
                info!("Saved {}", image_path.display());
                *written += 1;
            }

            checkpoint.advance(key, page_number);
            self.store.save(checkpoint).map_err(|e| ItemError::Checkpoint {
                path: doc.path.clone(),
                detail: e.to_string(),
            })?;
        }
        Ok(total)
    }

    async fn page_count(&self, doc: &Path) -> Result<usize, ItemError> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let path = doc.to_path_buf();
        let count = tokio::task::spawn_blocking(move || rasterizer.page_count(&path))
            .await
            .unwrap_or_else(|e| Err(RenderError(format!("render task failed: {e}"))));
        count.map_err(|e| ItemError::PageCount {
            path: doc.to_path_buf(),
            detail: e.to_string(),
        })
    }

    async fn render_to(&self, doc: &Path, page_number: usize, target: &Path) -> Result<(), ItemError> {
        let render_err = |detail: String| ItemError::Render {
            path: doc.to_path_buf(),
            page: page_number,
            detail,
        };

        let rasterizer = Arc::clone(&self.rasterizer);
        let path = doc.to_path_buf();
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
            let image = rasterizer
                .render_page(&path, page_number)
                .map_err(|e| e.to_string())?;
            encode_png(&image).map_err(|e| format!("PNG encoding failed: {e}"))
        })
        .await
        .map_err(|e| render_err(format!("render task failed: {e}")))?
        .map_err(render_err)?;

        write_output(target, &png).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Pages {
        total: usize,
        fail_on: Option<usize>,
        renders: AtomicUsize,
    }

    impl Rasterizer for Pages {
        fn page_count(&self, _doc: &Path) -> Result<usize, RenderError> {
            Ok(self.total)
        }

        fn render_page(&self, _doc: &Path, page_number: usize) -> Result<DynamicImage, RenderError> {
            if self.fail_on == Some(page_number) {
                return Err(RenderError("damaged page".into()));
            }
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]))))
        }
    }

    fn setup(dir: &TempDir) -> (PipelineConfig, WorkItem, CheckpointStore) {
        let config = PipelineConfig::builder()
            .pdf_root(dir.path().join("pdfs"))
            .image_root(dir.path().join("images"))
            .text_root(dir.path().join("text"))
            .checkpoint_path(dir.path().join("cp.json"))
            .build()
            .unwrap();
        let doc = WorkItem {
            path: dir.path().join("pdfs/box1/letters.pdf"),
            group: "box1".into(),
            ordinal: None,
            order: 0,
        };
        let store = CheckpointStore::new(&config.checkpoint_path);
        (config, doc, store)
    }

    #[test]
    fn image_path_layout() {
        let dir = TempDir::new().unwrap();
        let (config, doc, _) = setup(&dir);
        assert_eq!(
            page_image_path(&config, &doc, 3),
            dir.path().join("images/box1/letters_page_3.png")
        );
    }

    #[test]
    fn image_path_mirrors_nested_folders() {
        let dir = TempDir::new().unwrap();
        let (config, _, _) = setup(&dir);
        let doc = |rel: &str| WorkItem {
            path: dir.path().join("pdfs").join(rel),
            group: "box1".into(),
            ordinal: None,
            order: 0,
        };
        let a = page_image_path(&config, &doc("2019/box1/letter.pdf"), 1);
        let b = page_image_path(&config, &doc("2020/box1/letter.pdf"), 1);
        assert_eq!(a, dir.path().join("images/2019/box1/letter_page_1.png"));
        assert_eq!(b, dir.path().join("images/2020/box1/letter_page_1.png"));
    }

    #[test]
    fn image_path_outside_pdf_root_uses_group() {
        let dir = TempDir::new().unwrap();
        let (config, _, _) = setup(&dir);
        let doc = WorkItem {
            path: PathBuf::from("/elsewhere/box9/memo.pdf"),
            group: "box9".into(),
            ordinal: None,
            order: 0,
        };
        assert_eq!(
            page_image_path(&config, &doc, 2),
            dir.path().join("images/box9/memo_page_2.png")
        );
    }

    #[tokio::test]
    async fn converts_all_pages_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let (config, doc, store) = setup(&dir);
        let raster = Arc::new(Pages {
            total: 3,
            fail_on: None,
            renders: AtomicUsize::new(0),
        });
        let stage = ConversionStage::new(raster.clone(), store.clone());
        let mut cp = Checkpoint::new();

        let d = stage.convert_document(&config, &doc, &mut cp).await;
        assert_eq!(
            d,
            DocumentDisposition::Converted {
                total_pages: 3,
                pages_written: 3,
                pages_reused: 0
            }
        );
        for n in 1..=3 {
            assert!(page_image_path(&config, &doc, n).exists());
        }
        assert_eq!(store.load().unwrap().get(&doc.display()), 3);

        let d = stage.convert_document(&config, &doc, &mut cp).await;
        assert_eq!(d, DocumentDisposition::UpToDate { total_pages: 3 });
        assert_eq!(raster.renders.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_keeps_earlier_pages_and_resumes() {
        let dir = TempDir::new().unwrap();
        let (config, doc, store) = setup(&dir);
        let broken = Arc::new(Pages {
            total: 4,
            fail_on: Some(3),
            renders: AtomicUsize::new(0),
        });
        let mut cp = Checkpoint::new();
        let d = ConversionStage::new(broken, store.clone())
            .convert_document(&config, &doc, &mut cp)
            .await;
        assert!(matches!(d, DocumentDisposition::Failed { pages_written: 2, .. }));
        assert_eq!(store.load().unwrap().get(&doc.display()), 2);

        let fixed = Arc::new(Pages {
            total: 4,
            fail_on: None,
            renders: AtomicUsize::new(0),
        });
        let mut cp = store.load().unwrap();
        let d = ConversionStage::new(fixed.clone(), store.clone())
            .convert_document(&config, &doc, &mut cp)
            .await;
        assert!(matches!(d, DocumentDisposition::Converted { pages_written: 2, .. }));
        assert_eq!(fixed.renders.load(Ordering::SeqCst), 2);
        assert_eq!(store.load().unwrap().get(&doc.display()), 4);
    }

    #[tokio::test]
    async fn existing_image_advances_checkpoint_without_render() {
        let dir = TempDir::new().unwrap();
        let (config, doc, store) = setup(&dir);
        let first = page_image_path(&config, &doc, 1);
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"already here").unwrap();

        let raster = Arc::new(Pages {
            total: 2,
            fail_on: None,
            renders: AtomicUsize::new(0),
        });
        let mut cp = Checkpoint::new();
        let d = ConversionStage::new(raster.clone(), store.clone())
            .convert_document(&config, &doc, &mut cp)
            .await;
        assert_eq!(
            d,
            DocumentDisposition::Converted {
                total_pages: 2,
                pages_written: 1,
                pages_reused: 1
            }
        );
        assert_eq!(raster.renders.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"already here");
        assert_eq!(cp.get(&doc.display()), 2);
    }
}
