//! Extraction-service collaborator contract.
//!
//! The pipeline talks to "something that reads page images" through the
//! [`ExtractionService`] trait: register an image, ask for a transcription,
//! release whatever was registered. The structured [`ServiceResponse`] is the
//! only thing outcome classification looks at, so each backend translates its
//! own wire format (Gemini finish reasons, OpenAI-style finish reasons, error
//! payloads) into these types exactly once.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// A page image registered with the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFile {
    /// Uploaded to the service's file store; must be released afterwards.
    Uploaded {
        /// Resource name used for deletion, e.g. `files/abc123`.
        name: String,
        /// URI referenced from generation requests.
        uri: String,
        mime_type: String,
    },
    /// Sent inline with the request; nothing to release.
    Inline { data: String, mime_type: String },
}

impl RemoteFile {
    /// Short identifier for logs.
    pub fn handle(&self) -> &str {
        match self {
            RemoteFile::Uploaded { name, .. } => name,
            RemoteFile::Inline { .. } => "<inline>",
        }
    }
}

/// Why the service stopped generating for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishIndicator {
    /// Natural end of the answer.
    Stop,
    /// Output token limit reached; the text is truncated.
    MaxTokens,
    /// Blocked by a safety or content policy.
    Safety,
    /// Blocked for reproducing training data verbatim.
    Recitation,
    /// Anything else, with the raw value for the ledger.
    Other(String),
}

impl FinishIndicator {
    /// Map a Gemini `finishReason` string.
    pub fn from_gemini(raw: &str) -> Self {
        match raw {
            "STOP" => FinishIndicator::Stop,
            "MAX_TOKENS" => FinishIndicator::MaxTokens,
            "SAFETY" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
                FinishIndicator::Safety
            }
            "RECITATION" => FinishIndicator::Recitation,
            other => FinishIndicator::Other(other.to_string()),
        }
    }
}

/// One generated answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub finish: FinishIndicator,
    /// Transcribed text; `None` when the service returned no content parts.
    pub text: Option<String>,
}

/// Token accounting reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageMetadata {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl fmt::Display for UsageMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prompt {} / output {} / total {} tokens",
            self.prompt_tokens, self.output_tokens, self.total_tokens
        )
    }
}

/// Structured result of one generation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Zero or more candidates; only the first is used.
    pub candidates: Vec<Candidate>,
    pub usage: Option<UsageMetadata>,
    /// Prompt-level block reported instead of any candidate.
    pub block_reason: Option<String>,
}

/// Category of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The service asked us to slow down (HTTP 429, `RESOURCE_EXHAUSTED`).
    RateLimited,
    /// Non-success HTTP status other than rate limiting.
    Http { status: u16 },
    /// Connection, TLS, timeout, or provider-library failure.
    Transport,
    /// The response body could not be understood.
    Decode,
}

/// Transport or API failure raised by a service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from a bare message, classifying it by its text.
    ///
    /// For backends whose error types carry no structured status.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message_signals_rate_limit(&message) {
            ServiceErrorKind::RateLimited
        } else {
            ServiceErrorKind::Transport
        };
        Self { kind, message }
    }

    /// Structured category first, message text only as a fallback.
    pub fn is_rate_limited(&self) -> bool {
        match self.kind {
            ServiceErrorKind::RateLimited => true,
            ServiceErrorKind::Http { status } => status == 429,
            _ => message_signals_rate_limit(&self.message),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ServiceErrorKind::RateLimited => write!(f, "rate limited: {}", self.message),
            ServiceErrorKind::Http { status } => write!(f, "HTTP {status}: {}", self.message),
            ServiceErrorKind::Transport => write!(f, "transport error: {}", self.message),
            ServiceErrorKind::Decode => write!(f, "undecodable response: {}", self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

fn message_signals_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    message.contains("429")
        || message.contains("RESOURCE_EXHAUSTED")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
}

/// A file currently stored on the service side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteUpload {
    pub name: String,
    pub display_name: Option<String>,
    pub size_bytes: Option<u64>,
    pub create_time: Option<String>,
}

/// Text-extraction collaborator.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Backend name for logs and errors.
    fn name(&self) -> &str;

    /// Register a page image with the service.
    async fn upload(&self, image: &Path) -> Result<RemoteFile, ServiceError>;

    /// Single-turn request: transcribe `file` following `instruction`.
    async fn generate(
        &self,
        file: &RemoteFile,
        instruction: &str,
    ) -> Result<ServiceResponse, ServiceError>;

    /// Release the remote resource created by [`Self::upload`].
    async fn release(&self, file: &RemoteFile) -> Result<(), ServiceError>;

    /// Files currently held by the service for this account.
    async fn list_uploads(&self) -> Result<Vec<RemoteUpload>, ServiceError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_finish_reasons() {
        assert_eq!(FinishIndicator::from_gemini("STOP"), FinishIndicator::Stop);
        assert_eq!(
            FinishIndicator::from_gemini("MAX_TOKENS"),
            FinishIndicator::MaxTokens
        );
        assert_eq!(FinishIndicator::from_gemini("SAFETY"), FinishIndicator::Safety);
        assert_eq!(
            FinishIndicator::from_gemini("PROHIBITED_CONTENT"),
            FinishIndicator::Safety
        );
        assert_eq!(
            FinishIndicator::from_gemini("RECITATION"),
            FinishIndicator::Recitation
        );
        assert_eq!(
            FinishIndicator::from_gemini("FINISH_REASON_UNSPECIFIED"),
            FinishIndicator::Other("FINISH_REASON_UNSPECIFIED".into())
        );
    }

    #[test]
    fn structured_rate_limit_wins() {
        assert!(ServiceError::new(ServiceErrorKind::RateLimited, "slow down").is_rate_limited());
        assert!(ServiceError::new(ServiceErrorKind::Http { status: 429 }, "x").is_rate_limited());
        assert!(!ServiceError::new(ServiceErrorKind::Http { status: 500 }, "boom").is_rate_limited());
    }

    #[test]
    fn message_fallback_detects_rate_limit() {
        assert!(ServiceError::from_message("upstream said 429 Too Many Requests").is_rate_limited());
        assert!(ServiceError::from_message("Rate limit exceeded for model").is_rate_limited());
        assert!(ServiceError::new(ServiceErrorKind::Transport, "RESOURCE_EXHAUSTED").is_rate_limited());
        assert!(!ServiceError::from_message("connection reset by peer").is_rate_limited());
    }

    #[test]
    fn remote_file_handle() {
        let f = RemoteFile::Uploaded {
            name: "files/abc".into(),
            uri: "https://x/files/abc".into(),
            mime_type: "image/png".into(),
        };
        assert_eq!(f.handle(), "files/abc");
        let i = RemoteFile::Inline {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
        };
        assert_eq!(i.handle(), "<inline>");
    }

    #[test]
    fn usage_display() {
        let u = UsageMetadata {
            prompt_tokens: 10,
            output_tokens: 8192,
            total_tokens: 8202,
        };
        assert_eq!(u.to_string(), "prompt 10 / output 8192 / total 8202 tokens");
    }
}
