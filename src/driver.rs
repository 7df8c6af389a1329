//! Pipeline driver: sequences the stages and owns the run state.
//!
//! A run walks a fixed phase sequence, logging every transition:
//!
//! ```text
//! Init ──▶ Scanning ──▶ Converting ──▶ Extracting ──▶ Reporting ──▶ Done
//! ```
//!
//! `Init` loads the checkpoint and the failure ledger; both are fatal when
//! corrupt. Conversion and extraction are skipped according to the
//! [`RunMode`]. Inside a stage, item errors are logged and counted, and the
//! loop moves on. Only the errors returned as `Err` end the run early: an
//! unreadable root, a corrupt store, a ledger that cannot be appended to,
//! or a rate-limit signal from the extraction service.

use crate::config::{ExtractionConfig, PipelineConfig, RunMode};
use crate::error::PipelineError;
use crate::output::{
    write_output, CleanupReport, ConversionStats, ExtractionStats, PatternCount, RunReport,
};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::convert::{ConversionStage, DocumentDisposition};
use crate::pipeline::encode::PNG_MIME;
use crate::pipeline::extract::{ExistingOutputs, ExtractionStage, PageDisposition, SkipReason};
use crate::pipeline::ledger::{reason_category, FailureLedger, LedgerIndex};
use crate::pipeline::postprocess::CleanupRules;
use crate::pipeline::render::{PdfiumRasterizer, Rasterizer};
use crate::pipeline::scan::{CorpusScanner, WorkItem};
use crate::pipeline::service::{ExtractionService, RemoteFile, RemoteUpload};
use crate::progress::{NoopProgressCallback, PipelineProgressCallback, Stage};
use crate::prompts::DEFAULT_INSTRUCTION;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

static NOOP: NoopProgressCallback = NoopProgressCallback;

/// Phase of a run, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Scanning,
    Converting,
    Extracting,
    Reporting,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Init => "init",
            RunPhase::Scanning => "scanning",
            RunPhase::Converting => "converting",
            RunPhase::Extracting => "extracting",
            RunPhase::Reporting => "reporting",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// One batch pipeline over a corpus.
///
/// # Example
/// ```rust,no_run
/// use pdfocr::{ExtractionConfig, GeminiService, Pipeline, PipelineConfig, RunMode};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::builder().pdf_root("scans/").build()?;
/// let extraction = ExtractionConfig::builder()
///     .api_key(std::env::var("GEMINI_API_KEY")?)
///     .build()?;
/// let service = Arc::new(GeminiService::new(&extraction)?);
///
/// let report = Pipeline::new(config)
///     .with_extraction(service, &extraction)
///     .run(RunMode::All)
///     .await?;
/// println!("{} pages transcribed", report.extraction.map(|e| e.processed).unwrap_or(0));
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    service: Option<Arc<dyn ExtractionService>>,
    instruction: String,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            rasterizer: None,
            service: None,
            instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }

    /// Use `rasterizer` instead of binding pdfium at run time.
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Extraction service; required for [`RunMode::Extract`] and [`RunMode::All`].
    pub fn with_service(mut self, service: Arc<dyn ExtractionService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Service plus the instruction from the config it was built from.
    pub fn with_extraction(
        self,
        service: Arc<dyn ExtractionService>,
        extraction: &ExtractionConfig,
    ) -> Self {
        self.with_service(service)
            .instruction(extraction.instruction.clone())
    }

    /// Instruction sent with every page image. Default: [`DEFAULT_INSTRUCTION`].
    ///
    /// Services only take model options from [`ExtractionConfig`]; its
    /// `instruction` field reaches the model through this method or
    /// [`Pipeline::with_extraction`].
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn progress(&self) -> &dyn PipelineProgressCallback {
        match &self.config.progress_callback {
            Some(cb) => cb.as_ref(),
            None => &NOOP,
        }
    }

    /// Execute the stages selected by `mode`.
    ///
    /// # Errors
    /// Any fatal [`PipelineError`]; item-level failures only show up in the
    /// returned [`RunReport`].
    pub async fn run(&self, mode: RunMode) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut report = RunReport {
            mode,
            ..Default::default()
        };

        phase(RunPhase::Init);
        let config = self.prepare_roots(mode)?;
        let store = CheckpointStore::new(&config.checkpoint_path);
        let ledger = FailureLedger::new(&config.ledger_path);
        let mut checkpoint = if mode.converts() {
            Some(store.load()?)
        } else {
            None
        };
        let mut index = if mode.extracts() {
            Some(ledger.load()?)
        } else {
            None
        };
        let service = if mode.extracts() {
            Some(self.service.clone().ok_or_else(|| PipelineError::ServiceNotConfigured {
                service: "extraction".into(),
                hint: "No extraction service was supplied to the pipeline.".into(),
            })?)
        } else {
            None
        };
        let rasterizer = match (mode.converts(), &self.rasterizer) {
            (false, _) => None,
            (true, Some(r)) => Some(Arc::clone(r)),
            (true, None) => Some(Arc::new(PdfiumRasterizer::new(
                config.pdfium_library_path.clone(),
                config.max_rendered_pixels,
            )?) as Arc<dyn Rasterizer>),
        };

        if let (Some(checkpoint), Some(rasterizer)) = (checkpoint.as_mut(), rasterizer) {
            phase(RunPhase::Scanning);
            let scanner = CorpusScanner::new(&config.pdf_root, &config.document_extension)?;
            let docs = scanner.collect();

            phase(RunPhase::Converting);
            let stage = ConversionStage::new(rasterizer, store.clone());
            report.conversion = Some(self.convert_all(&config, &stage, &docs, checkpoint).await);
        }

        if let (Some(index), Some(service)) = (index.as_mut(), service) {
            phase(RunPhase::Scanning);
            let scanner = CorpusScanner::new(&config.image_root, &config.image_extension)?;
            let images = scanner.collect();
            let mut existing = ExistingOutputs::scan(&config.text_root)?;

            phase(RunPhase::Extracting);
            let stage = ExtractionStage::new(
                service,
                ledger.clone(),
                self.instruction.clone(),
                config.preview_chars,
            );
            let stats = self
                .extract_all(&config, &stage, &images, &mut existing, index)
                .await;
            match stats {
                Ok(stats) => report.extraction = Some(stats),
                Err(e) => {
                    error!("Run stopped: {}", e);
                    return Err(e);
                }
            }
        }

        phase(RunPhase::Reporting);
        report.duration_ms = started.elapsed().as_millis() as u64;
        log_report(&report);

        phase(RunPhase::Done);
        Ok(report)
    }

    /// Create output roots and resolve every root to its canonical form so
    /// scanned paths and derived output paths share one prefix.
    fn prepare_roots(&self, mode: RunMode) -> Result<PipelineConfig, PipelineError> {
        let mut config = self.config.clone();

        if mode.converts() {
            std::fs::create_dir_all(&config.image_root).map_err(access_error(&self.config.image_root))?;
            config.pdf_root = config
                .pdf_root
                .canonicalize()
                .map_err(access_error(&self.config.pdf_root))?;
        }
        if mode.extracts() {
            std::fs::create_dir_all(&config.text_root).map_err(access_error(&self.config.text_root))?;
            config.text_root = config
                .text_root
                .canonicalize()
                .map_err(access_error(&self.config.text_root))?;
        }
        config.image_root = config
            .image_root
            .canonicalize()
            .map_err(access_error(&self.config.image_root))?;
        Ok(config)
    }

    async fn convert_all(
        &self,
        config: &PipelineConfig,
        stage: &ConversionStage,
        docs: &[WorkItem],
        checkpoint: &mut Checkpoint,
    ) -> ConversionStats {
        let progress = self.progress();
        let mut stats = ConversionStats {
            discovered: docs.len(),
            ..Default::default()
        };
        info!("{} documents under {}", docs.len(), config.pdf_root.display());
        progress.on_stage_start(Stage::Convert, docs.len());

        for doc in docs {
            let key = doc.display();
            progress.on_item_start(Stage::Convert, &key);
            match stage.convert_document(config, doc, checkpoint).await {
                DocumentDisposition::UpToDate { total_pages } => {
                    stats.skipped += 1;
                    progress.on_item_skipped(
                        Stage::Convert,
                        &key,
                        &format!("all {total_pages} pages converted"),
                    );
                }
                DocumentDisposition::Converted {
                    total_pages,
                    pages_written,
                    pages_reused,
                } => {
                    stats.processed += 1;
                    stats.pages_written += pages_written;
                    stats.pages_reused += pages_reused;
                    progress.on_item_complete(
                        Stage::Convert,
                        &key,
                        &format!("{total_pages} pages"),
                    );
                }
                DocumentDisposition::Failed {
                    error,
                    pages_written,
                    pages_reused,
                } => {
                    stats.failed += 1;
                    stats.pages_written += pages_written;
                    stats.pages_reused += pages_reused;
                    progress.on_item_error(Stage::Convert, &key, &error);
                }
            }
        }

        progress.on_stage_complete(Stage::Convert, stats.processed, stats.failed);
        stats
    }

    async fn extract_all(
        &self,
        config: &PipelineConfig,
        stage: &ExtractionStage,
        images: &[WorkItem],
        existing: &mut ExistingOutputs,
        index: &mut LedgerIndex,
    ) -> Result<ExtractionStats, PipelineError> {
        let progress = self.progress();
        let mut stats = ExtractionStats {
            discovered: images.len(),
            ..Default::default()
        };
        info!(
            "{} page images under {}, {} text outputs, {} ledgered",
            images.len(),
            config.image_root.display(),
            existing.len(),
            index.len()
        );
        progress.on_stage_start(Stage::Extract, images.len());

        for image in images {
            let key = image.display();
            let output = config.text_path_for(&image.path);
            if stage.guard(&key, &output, existing, index).is_none() {
                progress.on_item_start(Stage::Extract, &key);
            }

            match stage.extract_page(config, image, existing, index).await? {
                PageDisposition::Processed {
                    output,
                    chars,
                    preview,
                } => {
                    stats.processed += 1;
                    progress.on_item_complete(
                        Stage::Extract,
                        &key,
                        &format!("{chars} chars → {}: {preview}", output.display()),
                    );
                }
                PageDisposition::Skipped(reason) => {
                    match reason {
                        SkipReason::OutputExists => stats.skipped_existing += 1,
                        SkipReason::InLedger => stats.skipped_ledger += 1,
                    }
                    progress.on_item_skipped(Stage::Extract, &key, reason.as_str());
                }
                PageDisposition::Ledgered { reason } => {
                    *stats
                        .ledgered
                        .entry(reason_category(&reason).to_string())
                        .or_insert(0) += 1;
                    progress.on_item_error(Stage::Extract, &key, &reason);
                }
                PageDisposition::Failed { error } => {
                    stats.failed += 1;
                    progress.on_item_error(Stage::Extract, &key, &error);
                }
            }
        }

        progress.on_stage_complete(
            Stage::Extract,
            stats.processed,
            stats.failed + stats.ledgered_total(),
        );
        Ok(stats)
    }

    /// Apply `rules` to every text file under the text root.
    ///
    /// Files whose content is unchanged are not rewritten; with `dry_run`
    /// nothing is written at all. Unreadable or unwritable files are logged
    /// and counted.
    pub async fn cleanup(
        &self,
        rules: &CleanupRules,
        dry_run: bool,
    ) -> Result<CleanupReport, PipelineError> {
        let progress = self.progress();
        let scanner = CorpusScanner::new(&self.config.text_root, "txt")?;
        let files = scanner.collect();

        let mut totals = vec![0usize; rules.len()];
        let mut report = CleanupReport {
            files_scanned: files.len(),
            dry_run,
            ..Default::default()
        };
        progress.on_stage_start(Stage::Cleanup, files.len());

        for file in &files {
            let key = file.display();
            progress.on_item_start(Stage::Cleanup, &key);
            let original = match tokio::fs::read_to_string(&file.path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("Cannot read {}: {}", key, e);
                    report.files_failed += 1;
                    progress.on_item_error(Stage::Cleanup, &key, &e.to_string());
                    continue;
                }
            };

            let (cleaned, counts) = rules.apply(&original);
            for (total, n) in totals.iter_mut().zip(&counts) {
                *total += n;
            }
            if cleaned == original {
                progress.on_item_skipped(Stage::Cleanup, &key, "no matches");
                continue;
            }

            report.files_changed += 1;
            if dry_run {
                progress.on_item_complete(Stage::Cleanup, &key, "would change");
                continue;
            }
            match write_output(&file.path, cleaned.as_bytes()).await {
                Ok(()) => progress.on_item_complete(Stage::Cleanup, &key, "rewritten"),
                Err(e) => {
                    warn!("{}", e);
                    report.files_failed += 1;
                    progress.on_item_error(Stage::Cleanup, &key, &e.to_string());
                }
            }
        }

        report.patterns = rules
            .iter()
            .zip(totals)
            .map(|(rule, matches)| PatternCount {
                pattern: rule.pattern.clone(),
                matches,
            })
            .collect();
        progress.on_stage_complete(Stage::Cleanup, report.files_changed, report.files_failed);
        info!(
            "Cleanup: {} files scanned, {} changed{}",
            report.files_scanned,
            report.files_changed,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    /// Load the failure ledger without touching anything else.
    pub fn ledger(&self) -> Result<LedgerIndex, PipelineError> {
        FailureLedger::new(&self.config.ledger_path).load()
    }
}

/// Outcome of deleting remote uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Delete each of `uploads` from the service; failures are logged and counted.
pub async fn purge_uploads(service: &dyn ExtractionService, uploads: &[RemoteUpload]) -> PurgeReport {
    let mut report = PurgeReport::default();
    for upload in uploads {
        let file = RemoteFile::Uploaded {
            name: upload.name.clone(),
            uri: String::new(),
            mime_type: PNG_MIME.to_string(),
        };
        match service.release(&file).await {
            Ok(()) => {
                info!("Deleted {}", upload.name);
                report.deleted += 1;
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", upload.name, e);
                report.failed += 1;
            }
        }
    }
    report
}

fn access_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::AccessError {
        path: path.to_path_buf(),
        source,
    }
}

fn phase(p: RunPhase) {
    info!("Phase: {}", p);
}

fn log_report(report: &RunReport) {
    if let Some(c) = &report.conversion {
        info!(
            "Conversion: {} documents, {} converted, {} up to date, {} failed ({} pages rendered, {} reused)",
            c.discovered, c.processed, c.skipped, c.failed, c.pages_written, c.pages_reused
        );
    }
    if let Some(e) = &report.extraction {
        info!(
            "Extraction: {} images, {} transcribed, {} skipped, {} ledgered, {} failed",
            e.discovered,
            e.processed,
            e.skipped(),
            e.ledgered_total(),
            e.failed
        );
    }
}
