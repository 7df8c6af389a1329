//! Extraction stage: page image → text file, or a failure-ledger row.
//!
//! For every image the stage runs a fixed sequence:
//!
//! ```text
//! guard ──▶ upload ──▶ generate ──▶ release ──▶ classify ──▶ write | ledger
//! ```
//!
//! The guard skips an image whose text output already exists or that is
//! already in the ledger, so re-running over a finished corpus makes no
//! service calls at all. Release runs whenever the upload succeeded, whatever
//! the generation did. Classification looks only at the structured
//! [`ServiceResponse`], never at exception text, except for the rate-limit
//! fallback in [`ServiceError::is_rate_limited`].

use crate::config::PipelineConfig;
use crate::error::{ItemError, PipelineError};
use crate::output::write_output;
use crate::pipeline::ledger::{FailureLedger, FailureRecord, LedgerIndex};
use crate::pipeline::postprocess::normalise_text;
use crate::pipeline::scan::{CorpusScanner, WorkItem};
use crate::pipeline::service::{
    ExtractionService, FinishIndicator, ServiceError, ServiceResponse,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one generation attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Complete transcription.
    Success(String),
    /// Generation stopped early; carries the ledger reason.
    Incomplete(String),
    /// Blocked by a content policy; carries the ledger reason.
    SafetyBlocked(String),
    /// No candidate at all.
    Empty,
    /// Transport or API error that is not rate limiting.
    TransientError(String),
    /// Rate limiting: the run must stop.
    FatalError(String),
}

impl ExtractionOutcome {
    /// Row reason for the failure ledger; `None` for outcomes that are not
    /// recorded there.
    pub fn ledger_reason(&self) -> Option<String> {
        match self {
            ExtractionOutcome::Success(_) | ExtractionOutcome::FatalError(_) => None,
            ExtractionOutcome::Incomplete(r) | ExtractionOutcome::SafetyBlocked(r) => {
                Some(r.clone())
            }
            ExtractionOutcome::Empty => Some("NO_CANDIDATES".to_string()),
            ExtractionOutcome::TransientError(e) => Some(format!("ERROR: {e}")),
        }
    }
}

/// Map a service result onto an [`ExtractionOutcome`].
///
/// Only the first candidate is considered. A `STOP` candidate's text is
/// normalised here, and one with nothing left after normalisation counts as
/// [`ExtractionOutcome::Empty`], so `Success` always carries the final text.
pub fn classify(result: Result<ServiceResponse, ServiceError>) -> ExtractionOutcome {
    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_rate_limited() => return ExtractionOutcome::FatalError(e.to_string()),
        Err(e) => return ExtractionOutcome::TransientError(e.to_string()),
    };

    let Some(candidate) = response.candidates.into_iter().next() else {
        return match response.block_reason {
            Some(reason) => ExtractionOutcome::SafetyBlocked(format!("SAFETY: prompt blocked ({reason})")),
            None => ExtractionOutcome::Empty,
        };
    };

    match candidate.finish {
        FinishIndicator::Stop => match candidate.text.as_deref().map(normalise_text) {
            Some(text) if !text.trim().is_empty() => ExtractionOutcome::Success(text),
            _ => ExtractionOutcome::Empty,
        },
        FinishIndicator::MaxTokens => {
            let reason = match response.usage {
                Some(u) => format!("MAX_TOKENS ({u})"),
                None => "MAX_TOKENS".to_string(),
            };
            ExtractionOutcome::Incomplete(reason)
        }
        FinishIndicator::Safety => ExtractionOutcome::SafetyBlocked("SAFETY".to_string()),
        FinishIndicator::Recitation => ExtractionOutcome::SafetyBlocked("RECITATION".to_string()),
        FinishIndicator::Other(raw) => ExtractionOutcome::Incomplete(format!("OTHER: {raw}")),
    }
}

/// Text files already present under the text root, gathered once per run.
#[derive(Debug, Clone, Default)]
pub struct ExistingOutputs {
    paths: HashSet<PathBuf>,
}

impl ExistingOutputs {
    /// Scan `text_root` for `.txt` files. A missing root yields an empty set.
    pub fn scan(text_root: &Path) -> Result<Self, PipelineError> {
        if !text_root.exists() {
            return Ok(Self::default());
        }
        let scanner = CorpusScanner::new(text_root, "txt")?;
        let paths: HashSet<PathBuf> = scanner.iter().map(|item| item.path).collect();
        debug!("{} existing text outputs under {}", paths.len(), text_root.display());
        Ok(Self { paths })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn insert(&mut self, path: PathBuf) {
        self.paths.insert(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Why the guard let an image go without calling the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutputExists,
    InLedger,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::OutputExists => "text output exists",
            SkipReason::InLedger => "listed in failure ledger",
        }
    }
}

/// Result of one image, as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageDisposition {
    /// Text written to `output`; `preview` is its first characters on one line.
    Processed {
        output: PathBuf,
        chars: usize,
        preview: String,
    },
    Skipped(SkipReason),
    /// Recorded in the failure ledger with `reason`.
    Ledgered { reason: String },
    /// Item-level error; nothing recorded, the next run retries.
    Failed { error: String },
}

/// Per-image worker for the extraction stage.
pub struct ExtractionStage {
    service: Arc<dyn ExtractionService>,
    ledger: FailureLedger,
    instruction: String,
    preview_chars: usize,
}

impl ExtractionStage {
    pub fn new(
        service: Arc<dyn ExtractionService>,
        ledger: FailureLedger,
        instruction: impl Into<String>,
        preview_chars: usize,
    ) -> Self {
        Self {
            service,
            ledger,
            instruction: instruction.into(),
            preview_chars,
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Idempotence guard: output present (known or on disk) or ledgered.
    pub fn guard(
        &self,
        key: &str,
        output: &Path,
        existing: &ExistingOutputs,
        index: &LedgerIndex,
    ) -> Option<SkipReason> {
        if existing.contains(output) || output.exists() {
            Some(SkipReason::OutputExists)
        } else if index.contains(key) {
            Some(SkipReason::InLedger)
        } else {
            None
        }
    }

    /// Process one page image.
    ///
    /// # Errors
    /// [`PipelineError::RateLimited`] when the service signals rate limiting,
    /// and [`PipelineError::LedgerWrite`] when a ledger row cannot be
    /// persisted. Everything else is reported through [`PageDisposition`].
    pub async fn extract_page(
        &self,
        config: &PipelineConfig,
        item: &WorkItem,
        existing: &mut ExistingOutputs,
        index: &mut LedgerIndex,
    ) -> Result<PageDisposition, PipelineError> {
        let key = item.display();
        let output = config.text_path_for(&item.path);

        if let Some(skip) = self.guard(&key, &output, existing, index) {
            debug!("Skipping {}: {}", key, skip.as_str());
            return Ok(PageDisposition::Skipped(skip));
        }

        info!("Processing {}", key);

        let remote = match self.service.upload(&item.path).await {
            Ok(remote) => remote,
            Err(e) if e.is_rate_limited() => return Err(self.rate_limited(e.to_string())),
            Err(e) => {
                let err = ItemError::Upload {
                    path: item.path.clone(),
                    detail: e.to_string(),
                };
                warn!("{}", err);
                return Ok(PageDisposition::Failed {
                    error: err.to_string(),
                });
            }
        };
        debug!("Uploaded {} as {}", key, remote.handle());

        let result = self.service.generate(&remote, &self.instruction).await;

        if let Err(e) = self.service.release(&remote).await {
            warn!("Failed to release {} for {}: {}", remote.handle(), key, e);
        }

        let usage = result.as_ref().ok().and_then(|r| r.usage);
        let outcome = classify(result);

        match outcome {
            ExtractionOutcome::Success(text) => {
                if let Err(err) = write_output(&output, text.as_bytes()).await {
                    warn!("{}", err);
                    return Ok(PageDisposition::Failed {
                        error: err.to_string(),
                    });
                }
                info!("Saved text output to {}", output.display());
                let shown = preview(&text, self.preview_chars);
                info!("Preview: {}", shown);
                let chars = text.chars().count();
                existing.insert(output.clone());
                Ok(PageDisposition::Processed {
                    output,
                    chars,
                    preview: shown,
                })
            }
            ExtractionOutcome::FatalError(detail) => Err(self.rate_limited(detail)),
            other => {
                let reason = other
                    .ledger_reason()
                    .ok_or_else(|| PipelineError::Internal(format!("no ledger reason for {other:?}")))?;
                match (&other, usage) {
                    (ExtractionOutcome::Incomplete(_), Some(u)) => {
                        warn!("{}: generation incomplete ({}), usage: {}", key, reason, u)
                    }
                    _ => warn!("{}: {}", key, reason),
                }
                let record = FailureRecord::new(key, reason.clone());
                self.ledger.append(&record)?;
                index.insert(&record);
                Ok(PageDisposition::Ledgered { reason })
            }
        }
    }

    fn rate_limited(&self, detail: String) -> PipelineError {
        PipelineError::RateLimited {
            service: self.service.name().to_string(),
            detail,
        }
    }
}

/// First `max_chars` characters of `text` on one line.
fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        format!("{flat}...")
    } else {
        flat
    }
}
