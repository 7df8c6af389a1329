//! CLI binary for pdfocr.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` / `ExtractionConfig`, picks an extraction backend, and
//! prints reports.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use pdfocr::{
    purge_uploads, CleanupReport, CleanupRules, ExtractionConfig, ExtractionService,
    GeminiService, LlmProviderService, Pipeline, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, RunMode, RunReport, Stage,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar per stage, plus a log line for every
/// item that produced output (with its transcript preview) or failed.
/// Skipped items only advance the bar and are totalled at the end of the
/// stage, so a resumed run over a mostly finished corpus stays quiet.
struct CliProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
    skipped: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
            skipped: AtomicUsize::new(0),
        })
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

fn short_name(item: &str) -> &str {
    item.rsplit(['/', '\\']).next().unwrap_or(item)
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let unit = match stage {
            Stage::Convert => "documents",
            Stage::Extract => "pages",
            Stage::Cleanup => "files",
        };
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>5}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}  ETA {{eta_precise}}  {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total_items as u64);
        bar.set_style(style);
        bar.set_prefix(stage.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total_items} {unit}"))
        ));

        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
        self.skipped.store(0, Ordering::SeqCst);
    }

    fn on_item_start(&self, _stage: Stage, item: &str) {
        let name = short_name(item).to_string();
        self.with_bar(|bar| bar.set_message(name));
    }

    fn on_item_complete(&self, _stage: Stage, item: &str, detail: &str) {
        self.with_bar(|bar| {
            bar.println(format!("  {} {}  {}", green("✓"), short_name(item), dim(detail)));
            bar.inc(1);
        });
    }

    fn on_item_skipped(&self, _stage: Stage, _item: &str, _reason: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.with_bar(|bar| bar.inc(1));
    }

    fn on_item_error(&self, _stage: Stage, item: &str, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.with_bar(|bar| {
            bar.println(format!("  {} {}  {}", red("✗"), short_name(item), red(&msg)));
            bar.inc(1);
        });
    }

    fn on_stage_complete(&self, stage: Stage, processed: usize, failed: usize) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(bar) = guard.take() {
                bar.finish_and_clear();
            }
        }
        let marker = if failed == 0 { green("✔") } else { yellow("⚠") };
        eprintln!(
            "{} {stage}: {} done, {} skipped, {} failed",
            marker,
            bold(&processed.to_string()),
            self.skipped.load(Ordering::SeqCst),
            if failed == 0 {
                failed.to_string()
            } else {
                red(&failed.to_string())
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline: PDFs → page PNGs → text
  pdfocr run --pdf-root archive/ --image-root out/images --text-root out/text

  # Only rasterise (no API key needed)
  pdfocr convert --pdf-root archive/

  # Only transcribe existing page images with another provider
  pdfocr extract --backend llm --provider openai --model gpt-4.1-mini

  # Fix recurring OCR misreads across the text corpus
  pdfocr cleanup --rules typos.json --dry-run

  # What failed, and why?
  pdfocr ledger

  # Delete files left on the Gemini Files API by interrupted runs
  pdfocr purge-uploads --yes

RESUMING:
  Every command is safe to re-run. Conversion resumes from the checkpoint
  file; extraction skips pages that already have a .txt output or are listed
  in the failure ledger. Delete a ledger row to retry that page.

EXIT CODES:
  0  finished (individual pages may have failed; see the ledger)
  1  stopped: rate limit, corrupt checkpoint/ledger, unreadable corpus root

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (gemini backend)
  OPENAI_API_KEY          OpenAI API key (llm backend)
  ANTHROPIC_API_KEY       Anthropic API key (llm backend)
  EDGEQUAKE_LLM_PROVIDER  Provider for the llm backend when --provider is unset
  EDGEQUAKE_MODEL         Model for the llm backend when --provider is unset
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Overrides the log filter
"#;

/// Resumable batch OCR: PDF archives → page images → text via vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdfocr",
    version,
    about = "Resumable batch OCR: PDF archives → page images → text via vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    paths: PathArgs,

    /// Print the report as JSON on stdout.
    #[arg(long, global = true, env = "PDFOCR_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PDFOCR_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFOCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFOCR_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterise every PDF page to PNG.
    Convert,
    /// Transcribe page images to text.
    Extract(ModelArgs),
    /// Convert, then extract.
    Run(ModelArgs),
    /// Apply regex replacement rules to every text file.
    Cleanup {
        /// JSON file: [{"pattern": "...", "replacement": "..."}, ...]
        #[arg(long, env = "PDFOCR_CLEANUP_RULES")]
        rules: PathBuf,

        /// Count matches without rewriting files.
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarise the failure ledger by reason.
    Ledger,
    /// List and delete files uploaded to the Gemini Files API.
    PurgeUploads {
        #[command(flatten)]
        model: ModelArgs,

        /// Delete without asking for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct PathArgs {
    /// Root of the PDF corpus.
    #[arg(long, global = true, env = "PDFOCR_PDF_ROOT", default_value = "./pdfs")]
    pdf_root: PathBuf,

    /// Where page images are written.
    #[arg(long, global = true, env = "PDFOCR_IMAGE_ROOT", default_value = "./output_images")]
    image_root: PathBuf,

    /// Where text files are written.
    #[arg(long, global = true, env = "PDFOCR_TEXT_ROOT", default_value = "./output_text")]
    text_root: PathBuf,

    /// Conversion checkpoint file.
    #[arg(long, global = true, env = "PDFOCR_CHECKPOINT", default_value = "./checkpoint_pdftopng.json")]
    checkpoint: PathBuf,

    /// Failure ledger file.
    #[arg(long, global = true, env = "PDFOCR_LEDGER", default_value = "./unfinished_files.csv")]
    ledger: PathBuf,

    /// Longest rendered edge in pixels.
    #[arg(long, global = true, env = "PDFOCR_MAX_PIXELS", default_value_t = 2000,
          value_parser = clap::value_parser!(u32).range(100..=10000))]
    max_pixels: u32,

    /// Directory containing the pdfium shared library.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Characters of each transcription echoed to the log.
    #[arg(long, global = true, env = "PDFOCR_PREVIEW_CHARS", default_value_t = 200)]
    preview_chars: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// Gemini REST API with the Files API.
    Gemini,
    /// Any edgequake-llm provider with inline images.
    Llm,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Extraction backend.
    #[arg(long, env = "PDFOCR_BACKEND", value_enum, default_value = "gemini")]
    backend: Backend,

    /// edgequake-llm provider (llm backend): openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model ID.
    #[arg(long, env = "PDFOCR_MODEL", default_value = "gemini-1.5-flash")]
    model: String,

    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Gemini REST base URL.
    #[arg(long, env = "PDFOCR_API_BASE", default_value = "https://generativelanguage.googleapis.com")]
    api_base: String,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "PDFOCR_TEMPERATURE", default_value_t = 1.0)]
    temperature: f32,

    /// Nucleus sampling.
    #[arg(long, env = "PDFOCR_TOP_P", default_value_t = 0.95)]
    top_p: f32,

    /// Top-k sampling.
    #[arg(long, env = "PDFOCR_TOP_K", default_value_t = 64)]
    top_k: u32,

    /// Max output tokens per page; longer pages go to the ledger as MAX_TOKENS.
    #[arg(long, env = "PDFOCR_MAX_OUTPUT_TOKENS", default_value_t = 8192)]
    max_output_tokens: u32,

    /// Path to a text file replacing the default instruction.
    #[arg(long, env = "PDFOCR_INSTRUCTION_FILE")]
    instruction_file: Option<PathBuf>,

    /// HTTP request timeout in seconds.
    #[arg(long, env = "PDFOCR_REQUEST_TIMEOUT", default_value_t = 300)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_pipeline_config(&cli.paths, progress_cb)?;

    match &cli.command {
        Command::Convert => {
            let report = Pipeline::new(config)
                .run(RunMode::Convert)
                .await
                .context("Conversion stopped")?;
            print_run_report(&report, cli.json)?;
        }
        Command::Extract(model) | Command::Run(model) => {
            let mode = if matches!(cli.command, Command::Run(_)) {
                RunMode::All
            } else {
                RunMode::Extract
            };
            let extraction = build_extraction_config(model).await?;
            let service = build_service(model, &extraction)?;
            let report = Pipeline::new(config)
                .with_extraction(service, &extraction)
                .run(mode)
                .await
                .context("Run stopped")?;
            print_run_report(&report, cli.json)?;
        }
        Command::Cleanup { rules, dry_run } => {
            let rules = CleanupRules::load(rules).context("Failed to load cleanup rules")?;
            let report = Pipeline::new(config)
                .cleanup(&rules, *dry_run)
                .await
                .context("Cleanup failed")?;
            print_cleanup_report(&report, cli.json)?;
        }
        Command::Ledger => {
            let index = Pipeline::new(config)
                .ledger()
                .context("Failed to read the failure ledger")?;
            let summary = index.summary();
            if cli.json {
                let json = serde_json::json!({
                    "items": index.len(),
                    "rows": index.rows(),
                    "by_reason": summary,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else {
                println!(
                    "{} items in {} ({} rows)",
                    bold(&index.len().to_string()),
                    cli.paths.ledger.display(),
                    index.rows()
                );
                for (category, count) in &summary {
                    println!("  {:<14} {}", category, count);
                }
            }
        }
        Command::PurgeUploads { model, yes } => {
            let extraction = build_extraction_config(model).await?;
            let service = GeminiService::new(&extraction).context("Gemini backend unavailable")?;
            let uploads = service
                .list_uploads()
                .await
                .context("Failed to list uploaded files")?;

            if uploads.is_empty() {
                eprintln!("{} No uploaded files.", green("✔"));
                return Ok(());
            }
            for u in &uploads {
                println!(
                    "{}  {}  {}",
                    u.name,
                    u.display_name.as_deref().unwrap_or("-"),
                    dim(u.create_time.as_deref().unwrap_or(""))
                );
            }
            if !*yes && !confirm(&format!("Delete {} files?", uploads.len()))? {
                eprintln!("Aborted.");
                return Ok(());
            }
            let report = purge_uploads(&service, &uploads).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("{} {} deleted, {} failed", green("✔"), report.deleted, report.failed);
            }
        }
    }

    Ok(())
}

/// Map path flags to `PipelineConfig`.
fn build_pipeline_config(paths: &PathArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .pdf_root(&paths.pdf_root)
        .image_root(&paths.image_root)
        .text_root(&paths.text_root)
        .checkpoint_path(&paths.checkpoint)
        .ledger_path(&paths.ledger)
        .max_rendered_pixels(paths.max_pixels)
        .preview_chars(paths.preview_chars);

    if let Some(ref dir) = paths.pdfium_lib {
        builder = builder.pdfium_library_path(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Map model flags to `ExtractionConfig`.
async fn build_extraction_config(model: &ModelArgs) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .model(&model.model)
        .temperature(model.temperature)
        .top_p(model.top_p)
        .top_k(model.top_k)
        .max_output_tokens(model.max_output_tokens)
        .api_base(&model.api_base)
        .request_timeout_secs(model.request_timeout);

    if let Some(ref key) = model.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref path) = model.instruction_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read instruction from {:?}", path))?;
        builder = builder.instruction(text.trim());
    }
    builder.build().context("Invalid model configuration")
}

fn build_service(model: &ModelArgs, extraction: &ExtractionConfig) -> Result<Arc<dyn ExtractionService>> {
    let service: Arc<dyn ExtractionService> = match model.backend {
        Backend::Gemini => Arc::new(GeminiService::new(extraction).context("Gemini backend unavailable")?),
        Backend::Llm => Arc::new(
            LlmProviderService::resolve(model.provider.as_deref(), extraction)
                .context("LLM provider unavailable")?,
        ),
    };
    Ok(service)
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    io::stderr().flush().ok();
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_run_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(report).context("Failed to serialise report")?;
        println!("{out}");
        return Ok(());
    }
    if let Some(c) = &report.conversion {
        eprintln!(
            "{}  {} documents: {} converted, {} up to date, {} failed  ({} pages rendered)",
            bold("convert"),
            c.discovered,
            c.processed,
            c.skipped,
            if c.failed == 0 {
                c.failed.to_string()
            } else {
                red(&c.failed.to_string())
            },
            c.pages_written
        );
    }
    if let Some(e) = &report.extraction {
        eprintln!(
            "{}  {} pages: {} transcribed, {} skipped, {} ledgered, {} failed",
            bold("extract"),
            e.discovered,
            e.processed,
            e.skipped(),
            e.ledgered_total(),
            e.failed
        );
        for (category, n) in &e.ledgered {
            eprintln!("           {:<14} {}", dim(category), n);
        }
    }
    eprintln!("{}", dim(&format!("{}ms total", report.duration_ms)));
    Ok(())
}

fn print_cleanup_report(report: &CleanupReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for p in &report.patterns {
        println!("{:>7}  {}", p.matches, p.pattern);
    }
    eprintln!(
        "{} {} files scanned, {} {}{}",
        green("✔"),
        report.files_scanned,
        report.files_changed,
        if report.dry_run { "would change" } else { "changed" },
        if report.files_failed > 0 {
            format!(", {}", red(&format!("{} failed", report.files_failed)))
        } else {
            String::new()
        }
    );
    Ok(())
}
