//! Integration tests for the full driver with in-memory collaborators.
//!
//! A fake rasteriser stands in for pdfium and a scripted service stands in
//! for the vision model, so every test runs offline:
//!
//! ```bash
//! cargo test --test pipeline
//! ```

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use pdfocr::{
    Candidate, ExtractionConfig, ExtractionService, FinishIndicator, Pipeline, PipelineConfig,
    PipelineError, PipelineProgressCallback, Rasterizer, RemoteFile, RenderError, RunMode,
    ServiceError, ServiceErrorKind, ServiceResponse, Stage, UsageMetadata,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Route library logs to the test harness; `RUST_LOG=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ── Fakes ────────────────────────────────────────────────────────────────

/// Every document has the same page count; `broken` pages fail to render
/// until `repair` is called.
struct FakeRasterizer {
    pages: usize,
    broken: Mutex<Vec<(String, usize)>>,
    renders: AtomicUsize,
}

impl FakeRasterizer {
    fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            broken: Mutex::new(Vec::new()),
            renders: AtomicUsize::new(0),
        })
    }

    fn break_page(&self, stem: &str, page: usize) {
        self.broken.lock().unwrap().push((stem.to_string(), page));
    }

    fn repair(&self) {
        self.broken.lock().unwrap().clear();
    }

    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl Rasterizer for FakeRasterizer {
    fn page_count(&self, _doc: &Path) -> Result<usize, RenderError> {
        Ok(self.pages)
    }

    fn render_page(&self, doc: &Path, page_number: usize) -> Result<DynamicImage, RenderError> {
        let stem = doc.file_stem().unwrap().to_string_lossy().into_owned();
        if self.broken.lock().unwrap().contains(&(stem, page_number)) {
            return Err(RenderError(format!("page {page_number} is damaged")));
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            8,
            8,
            Rgba([255, 255, 255, 255]),
        )))
    }
}

/// Answers by image file name; anything not scripted is transcribed.
#[derive(Default)]
struct FakeService {
    script: Mutex<HashMap<String, Result<ServiceResponse, ServiceError>>>,
    instructions: Mutex<Vec<String>>,
    uploads: AtomicUsize,
    generates: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeService {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, file_name: &str, response: Result<ServiceResponse, ServiceError>) {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_string(), response);
    }

    fn unscript(&self, file_name: &str) {
        self.script.lock().unwrap().remove(file_name);
    }

    fn generates(&self) -> usize {
        self.generates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionService for FakeService {
    fn name(&self) -> &str {
        "fake"
    }

    async fn upload(&self, image: &Path) -> Result<RemoteFile, ServiceError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        Ok(RemoteFile::Uploaded {
            uri: format!("mem://{name}"),
            name,
            mime_type: "image/png".into(),
        })
    }

    async fn generate(
        &self,
        file: &RemoteFile,
        instruction: &str,
    ) -> Result<ServiceResponse, ServiceError> {
        self.generates.fetch_add(1, Ordering::SeqCst);
        self.instructions
            .lock()
            .unwrap()
            .push(instruction.to_string());
        let name = file.handle().to_string();
        if let Some(scripted) = self.script.lock().unwrap().get(&name) {
            return scripted.clone();
        }
        Ok(answer(FinishIndicator::Stop, Some(&format!("Text of {name}"))))
    }

    async fn release(&self, _file: &RemoteFile) -> Result<(), ServiceError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn answer(finish: FinishIndicator, text: Option<&str>) -> ServiceResponse {
    ServiceResponse {
        candidates: vec![Candidate {
            finish,
            text: text.map(str::to_string),
        }],
        usage: Some(UsageMetadata {
            prompt_tokens: 1290,
            output_tokens: 8192,
            total_tokens: 9482,
        }),
        block_reason: None,
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────

struct Corpus {
    dir: TempDir,
    config: PipelineConfig,
}

impl Corpus {
    /// `pdfs/box1/{alpha,beta}.pdf` and `pdfs/box2/gamma.pdf`.
    fn new() -> Self {
        Self::with_documents(&["box1/alpha.pdf", "box1/beta.pdf", "box2/gamma.pdf"])
    }

    fn with_documents(docs: &[&str]) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        for doc in docs {
            let path = dir.path().join("pdfs").join(doc);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"%PDF-1.4\n").unwrap();
        }
        let config = PipelineConfig::builder()
            .pdf_root(dir.path().join("pdfs"))
            .image_root(dir.path().join("images"))
            .text_root(dir.path().join("text"))
            .checkpoint_path(dir.path().join("checkpoint.json"))
            .ledger_path(dir.path().join("ledger.csv"))
            .build()
            .unwrap();
        Self { dir, config }
    }

    fn pipeline(&self, raster: &Arc<FakeRasterizer>, service: &Arc<FakeService>) -> Pipeline {
        Pipeline::new(self.config.clone())
            .with_rasterizer(raster.clone())
            .with_service(service.clone())
    }

    fn files(&self, root: &str, ext: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = WalkDir::new(self.dir.path().join(root))
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|e| e == ext))
            .collect();
        out.sort();
        out
    }

    fn text(&self, rel: &str) -> PathBuf {
        self.dir.path().join("text").join(rel)
    }

    fn ledger_rows(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.config.ledger_path) {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn checkpoint(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(&self.config.checkpoint_path).unwrap();
        serde_json::from_str(&raw).unwrap()
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_converts_and_transcribes_every_page() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();

    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    assert_eq!(corpus.files("images", "png").len(), 6);
    assert_eq!(corpus.files("text", "txt").len(), 6);
    assert!(corpus.ledger_rows().is_empty());
    assert!(corpus.dir.path().join("images/box1/alpha_page_2.png").exists());
    assert_eq!(
        std::fs::read_to_string(corpus.text("box2/gamma_page_1.txt")).unwrap(),
        "Text of gamma_page_1.png\n"
    );

    let conversion = report.conversion.unwrap();
    assert_eq!(conversion.discovered, 3);
    assert_eq!(conversion.processed, 3);
    assert_eq!(conversion.pages_written, 6);
    let extraction = report.extraction.unwrap();
    assert_eq!(extraction.processed, 6);
    assert_eq!(extraction.ledgered_total(), 0);
    assert_eq!(service.releases.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn safety_block_is_ledgered_once_and_never_resubmitted() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();
    // Fourth page in scan order: box1/beta.pdf page 2.
    service.script("beta_page_2.png", Ok(answer(FinishIndicator::Safety, None)));

    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    assert_eq!(corpus.files("text", "txt").len(), 5);
    assert!(!corpus.text("box1/beta_page_2.txt").exists());
    let rows = corpus.ledger_rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].contains("beta_page_2.png"));
    assert!(rows[0].ends_with("SAFETY"));
    assert_eq!(report.extraction.unwrap().ledgered.get("SAFETY"), Some(&1));

    // Even a now-cooperative service is not asked again.
    service.unscript("beta_page_2.png");
    let before = service.generates();
    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    assert_eq!(service.generates(), before);
    assert_eq!(corpus.ledger_rows().len(), 1);
    let extraction = report.extraction.unwrap();
    assert_eq!(extraction.skipped_existing, 5);
    assert_eq!(extraction.skipped_ledger, 1);
}

#[tokio::test]
async fn truncated_page_goes_to_ledger_with_token_counts() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();
    service.script(
        "alpha_page_1.png",
        Ok(answer(FinishIndicator::MaxTokens, Some("half a page"))),
    );

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    assert!(!corpus.text("box1/alpha_page_1.txt").exists());
    let rows = corpus.ledger_rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].contains("MAX_TOKENS"));
    assert!(rows[0].contains("output 8192"));
}

#[tokio::test]
async fn text_output_and_ledger_row_are_exclusive() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();
    service.script("alpha_page_1.png", Ok(answer(FinishIndicator::Recitation, None)));
    service.script("gamma_page_2.png", Ok(ServiceResponse::default()));

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    let rows = corpus.ledger_rows();
    assert_eq!(rows.len(), 2);
    for image in corpus.files("images", "png") {
        let rel = image
            .strip_prefix(corpus.dir.path().join("images"))
            .unwrap()
            .with_extension("txt");
        let has_text = corpus.text(rel.to_str().unwrap()).exists();
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        let ledgered = rows.iter().any(|r| r.contains(&name));
        assert!(has_text ^ ledgered, "{name}: text={has_text} ledger={ledgered}");
    }
}

#[tokio::test]
async fn rate_limit_stops_the_run_without_ledgering() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();
    service.script(
        "alpha_page_2.png",
        Err(ServiceError::new(ServiceErrorKind::RateLimited, "quota exhausted")),
    );

    let err = corpus
        .pipeline(&raster, &service)
        .run(RunMode::All)
        .await
        .unwrap_err();
    assert!(err.is_rate_limit());
    assert!(matches!(err, PipelineError::RateLimited { .. }));

    // Stopped right after the second page, which was still released.
    assert_eq!(service.generates(), 2);
    assert_eq!(service.releases.load(Ordering::SeqCst), 2);
    assert_eq!(corpus.files("text", "txt").len(), 1);
    assert!(corpus.ledger_rows().is_empty());

    // Quota is back: the run picks up where it stopped.
    service.unscript("alpha_page_2.png");
    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    let extraction = report.extraction.unwrap();
    assert_eq!(extraction.skipped_existing, 1);
    assert_eq!(extraction.processed, 5);
    assert_eq!(corpus.files("text", "txt").len(), 6);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(3);
    let service = FakeService::new();

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    let renders = raster.renders();
    let generates = service.generates();
    let before = std::fs::read_to_string(corpus.text("box1/beta_page_3.txt")).unwrap();

    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    assert_eq!(raster.renders(), renders);
    assert_eq!(service.generates(), generates);
    assert_eq!(
        std::fs::read_to_string(corpus.text("box1/beta_page_3.txt")).unwrap(),
        before
    );
    assert_eq!(report.conversion.unwrap().skipped, 3);
    assert_eq!(report.extraction.unwrap().skipped_existing, 9);
}

#[tokio::test]
async fn conversion_resumes_after_a_failed_page() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(4);
    raster.break_page("beta", 3);
    let service = FakeService::new();

    let report = corpus.pipeline(&raster, &service).run(RunMode::Convert).await.unwrap();
    let conversion = report.conversion.unwrap();
    assert_eq!(conversion.failed, 1);
    assert_eq!(conversion.processed, 2);
    assert!(report.extraction.is_none());
    assert_eq!(corpus.files("images", "png").len(), 10);

    let checkpoint = corpus.checkpoint();
    let beta = checkpoint
        .as_object()
        .unwrap()
        .iter()
        .find(|(k, _)| k.ends_with("beta.pdf"))
        .map(|(_, v)| v.as_u64().unwrap());
    assert_eq!(beta, Some(2));

    raster.repair();
    let before = raster.renders();
    let report = corpus.pipeline(&raster, &service).run(RunMode::Convert).await.unwrap();
    assert_eq!(raster.renders() - before, 2);
    let conversion = report.conversion.unwrap();
    assert_eq!(conversion.processed, 1);
    assert_eq!(conversion.skipped, 2);
    assert_eq!(corpus.files("images", "png").len(), 12);
    for (_, page) in corpus.checkpoint().as_object().unwrap() {
        assert_eq!(page.as_u64(), Some(4));
    }
}

#[tokio::test]
async fn convert_mode_never_touches_the_service() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();

    corpus.pipeline(&raster, &service).run(RunMode::Convert).await.unwrap();

    assert_eq!(corpus.files("images", "png").len(), 6);
    assert!(corpus.files("text", "txt").is_empty());
    assert_eq!(service.uploads.load(Ordering::SeqCst), 0);
    assert!(!corpus.config.ledger_path.exists());
}

#[tokio::test]
async fn extract_mode_works_from_existing_images() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();
    corpus.pipeline(&raster, &service).run(RunMode::Convert).await.unwrap();

    // No rasteriser at all: extraction must not need one.
    let report = Pipeline::new(corpus.config.clone())
        .with_service(service.clone())
        .run(RunMode::Extract)
        .await
        .unwrap();
    assert!(report.conversion.is_none());
    assert_eq!(report.extraction.unwrap().processed, 3);
    assert_eq!(corpus.files("text", "txt").len(), 3);
}

#[tokio::test]
async fn corrupt_checkpoint_is_fatal_and_preserved() {
    let corpus = Corpus::new();
    std::fs::write(&corpus.config.checkpoint_path, "{ not json").unwrap();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();

    let err = corpus
        .pipeline(&raster, &service)
        .run(RunMode::All)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
    assert_eq!(raster.renders(), 0);
    assert_eq!(
        std::fs::read_to_string(&corpus.config.checkpoint_path).unwrap(),
        "{ not json"
    );
}

#[tokio::test]
async fn missing_pdf_root_is_an_access_error() {
    let corpus = Corpus::new();
    std::fs::remove_dir_all(&corpus.config.pdf_root).unwrap();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();

    let err = corpus
        .pipeline(&raster, &service)
        .run(RunMode::Convert)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AccessError { .. }));
}

#[tokio::test]
async fn same_folder_and_stem_in_different_subtrees_do_not_collide() {
    let corpus = Corpus::with_documents(&["2019/box1/letter.pdf", "2020/box1/letter.pdf"]);
    let raster = FakeRasterizer::new(2);
    let service = FakeService::new();

    let report = corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    assert_eq!(raster.renders(), 4);
    let conversion = report.conversion.unwrap();
    assert_eq!(conversion.pages_written, 4);
    assert_eq!(conversion.pages_reused, 0);
    assert!(corpus.dir.path().join("images/2019/box1/letter_page_2.png").exists());
    assert!(corpus.dir.path().join("images/2020/box1/letter_page_2.png").exists());
    assert!(corpus.text("2019/box1/letter_page_1.txt").exists());
    assert!(corpus.text("2020/box1/letter_page_1.txt").exists());
    assert_eq!(report.extraction.unwrap().processed, 4);
}

#[tokio::test]
async fn invisible_only_transcript_is_ledgered() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();
    service.script(
        "beta_page_1.png",
        Ok(answer(FinishIndicator::Stop, Some("\u{200B}\u{FEFF}"))),
    );

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    assert!(!corpus.text("box1/beta_page_1.txt").exists());
    let rows = corpus.ledger_rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].ends_with("NO_CANDIDATES"));
}

#[tokio::test]
async fn custom_instruction_reaches_the_service() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();

    corpus
        .pipeline(&raster, &service)
        .instruction("Transcribe the handwriting only.")
        .run(RunMode::All)
        .await
        .unwrap();

    let seen = service.instructions.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|i| i == "Transcribe the handwriting only."));
}

#[tokio::test]
async fn extraction_config_instruction_is_used() {
    let corpus = Corpus::new();
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();
    let extraction = ExtractionConfig::builder()
        .instruction("Only the printed text, please.")
        .build()
        .unwrap();

    Pipeline::new(corpus.config.clone())
        .with_rasterizer(raster.clone())
        .with_extraction(service.clone(), &extraction)
        .run(RunMode::All)
        .await
        .unwrap();

    let seen = service.instructions.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|i| i == "Only the printed text, please."));
}

/// Records `(stage, item, detail)` for every completed item.
#[derive(Default)]
struct Recorder {
    completed: Mutex<Vec<(Stage, String, String)>>,
    skipped: AtomicUsize,
}

impl PipelineProgressCallback for Recorder {
    fn on_item_complete(&self, stage: Stage, item: &str, detail: &str) {
        self.completed
            .lock()
            .unwrap()
            .push((stage, item.to_string(), detail.to_string()));
    }

    fn on_item_skipped(&self, _stage: Stage, _item: &str, _reason: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_reports_transcript_preview() {
    let mut corpus = Corpus::new();
    let recorder = Arc::new(Recorder::default());
    corpus.config.progress_callback = Some(recorder.clone());
    let raster = FakeRasterizer::new(1);
    let service = FakeService::new();

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();

    let completed = recorder.completed.lock().unwrap();
    let extract: Vec<_> = completed.iter().filter(|(s, _, _)| *s == Stage::Extract).collect();
    assert_eq!(extract.len(), 3);
    let (_, item, detail) = extract[0];
    assert!(item.ends_with("alpha_page_1.png"));
    assert!(detail.ends_with("Text of alpha_page_1.png"), "{detail}");
    drop(completed);

    corpus.pipeline(&raster, &service).run(RunMode::All).await.unwrap();
    // 3 up-to-date documents plus 3 existing transcripts.
    assert_eq!(recorder.skipped.load(Ordering::SeqCst), 6);
}
