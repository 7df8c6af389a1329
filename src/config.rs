//! Configuration types for the batch pipeline.
//!
//! Everything a run needs is held in two structs:
//!
//! * [`PipelineConfig`]: where the corpus lives, where images, text,
//!   checkpoint and ledger go, and how pages are rasterised.
//! * [`ExtractionConfig`]: model identifier and generation options handed to
//!   the extraction service constructor. Nothing about the model is global
//!   state; two pipelines with different models can run in one process.
//!
//! Both are built via a consuming builder whose `build()` validates the
//! result, the same way for every knob.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::prompts::DEFAULT_INSTRUCTION;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use pdfocr::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .pdf_root("scans/")
///     .image_root("out/images")
///     .text_root("out/text")
///     .build()
///     .unwrap();
/// assert_eq!(config.image_extension, "png");
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the nested PDF corpus. Default: `./pdfs`.
    pub pdf_root: PathBuf,

    /// Where page images are written, one sub-folder per source folder.
    /// Also the root scanned by the extraction stage. Default: `./output_images`.
    pub image_root: PathBuf,

    /// Where extracted text is written, mirroring `image_root`. Default: `./output_text`.
    pub text_root: PathBuf,

    /// Checkpoint file (JSON map document → last converted page).
    /// Default: `./checkpoint_pdftopng.json`.
    pub checkpoint_path: PathBuf,

    /// Failure ledger (append-only CSV `path,reason`). Default: `./unfinished_files.csv`.
    pub ledger_path: PathBuf,

    /// Source document extension, without the dot. Default: `pdf`.
    pub document_extension: String,

    /// Page image extension, without the dot. Default: `png`.
    pub image_extension: String,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    ///
    /// Caps either dimension so a poster-sized page cannot exhaust memory;
    /// the other dimension scales proportionally.
    pub max_rendered_pixels: u32,

    /// Directory holding the pdfium shared library. `None` binds the system library.
    pub pdfium_library_path: Option<PathBuf>,

    /// Characters of extracted text echoed in the log on success. Default: 200.
    pub preview_chars: usize,

    /// Optional per-item progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pdf_root: PathBuf::from("./pdfs"),
            image_root: PathBuf::from("./output_images"),
            text_root: PathBuf::from("./output_text"),
            checkpoint_path: PathBuf::from("./checkpoint_pdftopng.json"),
            ledger_path: PathBuf::from("./unfinished_files.csv"),
            document_extension: "pdf".to_string(),
            image_extension: "png".to_string(),
            max_rendered_pixels: 2000,
            pdfium_library_path: None,
            preview_chars: 200,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("pdf_root", &self.pdf_root)
            .field("image_root", &self.image_root)
            .field("text_root", &self.text_root)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("ledger_path", &self.ledger_path)
            .field("document_extension", &self.document_extension)
            .field("image_extension", &self.image_extension)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pdfium_library_path", &self.pdfium_library_path)
            .field("preview_chars", &self.preview_chars)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Text output path for a page image: same relative sub-path under
    /// `text_root`, extension replaced by `.txt`.
    ///
    /// Images outside `image_root` keep only their file name.
    pub fn text_path_for(&self, image: &Path) -> PathBuf {
        let relative = image
            .strip_prefix(&self.image_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| image.file_name().map(PathBuf::from).unwrap_or_default());
        self.text_root.join(relative).with_extension("txt")
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn pdf_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdf_root = path.into();
        self
    }

    pub fn image_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image_root = path.into();
        self
    }

    pub fn text_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.text_root = path.into();
        self
    }

    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = path.into();
        self
    }

    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ledger_path = path.into();
        self
    }

    pub fn document_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.document_extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    pub fn image_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.image_extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn preview_chars(mut self, n: usize) -> Self {
        self.config.preview_chars = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.document_extension.is_empty() || c.image_extension.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "File extensions must not be empty".into(),
            ));
        }
        if c.image_extension.eq_ignore_ascii_case("txt") {
            return Err(PipelineError::InvalidConfig(
                "Image extension 'txt' would collide with text outputs".into(),
            ));
        }
        if c.image_root == c.text_root {
            return Err(PipelineError::InvalidConfig(format!(
                "Image root and text root must differ, both are {:?}",
                c.image_root
            )));
        }
        Ok(self.config)
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Model and request options handed to an extraction service constructor.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Model identifier. Default: `gemini-1.5-flash`.
    pub model: String,

    /// Sampling temperature, 0.0–2.0. Default: 1.0.
    pub temperature: f32,

    /// Nucleus sampling. Default: 0.95.
    pub top_p: f32,

    /// Top-k sampling. Default: 64.
    pub top_k: u32,

    /// Maximum output tokens per page. Default: 8192.
    ///
    /// A page that needs more is reported as truncated and lands in the
    /// failure ledger instead of producing a half transcript.
    pub max_output_tokens: u32,

    /// Single-turn instruction sent with every image.
    pub instruction: String,

    /// API key. Never serialised.
    #[serde(skip)]
    pub api_key: Option<String>,

    /// REST base URL. Default: `https://generativelanguage.googleapis.com`.
    pub api_base: String,

    /// HTTP request timeout in seconds. Default: 300.
    pub request_timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 8192,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            api_key: None,
            api_base: "https://generativelanguage.googleapis.com".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("top_k", &self.top_k)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("instruction", &self.instruction)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.config.top_k = k;
        self
    }

    pub fn max_output_tokens(mut self, n: u32) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn instruction(mut self, text: impl Into<String>) -> Self {
        self.config.instruction = text.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, PipelineError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("Model must not be empty".into()));
        }
        if c.max_output_tokens == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_output_tokens must be ≥ 1".into(),
            ));
        }
        if c.instruction.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Instruction must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// PDF → page images only.
    Convert,
    /// Page images → text only.
    Extract,
    /// Both, conversion first. (default)
    #[default]
    All,
}

impl RunMode {
    pub fn converts(self) -> bool {
        matches!(self, RunMode::Convert | RunMode::All)
    }

    pub fn extracts(self) -> bool {
        matches!(self, RunMode::Extract | RunMode::All)
    }
}
