//! edgequake-llm backend for [`ExtractionService`].
//!
//! Lets the pipeline run against any vision-capable provider edgequake-llm
//! knows (OpenAI, Anthropic, Gemini, Ollama, ...). There is no file store on
//! this path: "upload" reads the PNG and base64-encodes it for an inline
//! image attachment, and release is a no-op.
//!
//! Chat completions expose no finish reason through the provider trait, so
//! truncation is inferred: a completion that used the whole `max_tokens`
//! budget is reported as [`FinishIndicator::MaxTokens`]. Provider errors that
//! mention a content filter become [`FinishIndicator::Safety`].

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::pipeline::encode::{to_base64, PNG_MIME};
use crate::pipeline::service::{
    Candidate, ExtractionService, FinishIndicator, RemoteFile, ServiceError, ServiceErrorKind,
    ServiceResponse, UsageMetadata,
};
use crate::prompts::TRANSCRIPTION_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// [`ExtractionService`] over an edgequake-llm provider.
pub struct LlmProviderService {
    provider: Arc<dyn LLMProvider>,
    label: String,
    options: CompletionOptions,
    max_tokens: usize,
}

impl LlmProviderService {
    /// Wrap an already configured provider.
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, config: &ExtractionConfig) -> Self {
        let max_tokens = config.max_output_tokens as usize;
        Self {
            provider,
            label: label.into(),
            options: build_options(config),
            max_tokens,
        }
    }

    /// Resolve a provider from a name or the environment.
    ///
    /// 1. `provider_name` given: create it with `config.model` (or a small
    ///    vision default when the model is still the Gemini default).
    /// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` both set: use them.
    /// 3. Otherwise let [`ProviderFactory::from_env`] pick from the API keys
    ///    present.
    pub fn resolve(provider_name: Option<&str>, config: &ExtractionConfig) -> Result<Self, PipelineError> {
        if let Some(name) = provider_name {
            let model = model_for(name, &config.model);
            let provider = create_vision_provider(name, model)?;
            return Ok(Self::new(provider, name, config));
        }

        if let (Ok(prov), Ok(model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !model.is_empty() {
                let provider = create_vision_provider(&prov, &model)?;
                return Ok(Self::new(provider, prov, config));
            }
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| PipelineError::ServiceNotConfigured {
                service: "llm".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                    Error: {}",
                    e
                ),
            })?;
        Ok(Self::new(provider, "llm", config))
    }
}

/// The Gemini default model name means nothing to other providers.
fn model_for<'a>(provider: &str, configured: &'a str) -> &'a str {
    let gemini_default = ExtractionConfig::default().model;
    if configured == gemini_default && !provider.eq_ignore_ascii_case("gemini") {
        DEFAULT_MODEL
    } else {
        configured
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ServiceNotConfigured {
            service: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_output_tokens as usize),
        ..Default::default()
    }
}

/// Map a chat completion onto a [`ServiceResponse`].
fn response_from_completion(
    content: String,
    prompt_tokens: usize,
    completion_tokens: usize,
    max_tokens: usize,
) -> ServiceResponse {
    let usage = Some(UsageMetadata {
        prompt_tokens: prompt_tokens as u64,
        output_tokens: completion_tokens as u64,
        total_tokens: (prompt_tokens + completion_tokens) as u64,
    });
    if content.trim().is_empty() {
        return ServiceResponse {
            candidates: Vec::new(),
            usage,
            block_reason: None,
        };
    }
    let finish = if completion_tokens >= max_tokens {
        FinishIndicator::MaxTokens
    } else {
        FinishIndicator::Stop
    };
    ServiceResponse {
        candidates: vec![Candidate {
            finish,
            text: Some(content),
        }],
        usage,
        block_reason: None,
    }
}

/// Map a provider error: content-filter refusals are a response, not an error.
fn response_from_error(message: String) -> Result<ServiceResponse, ServiceError> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("content_filter") || lower.contains("content filter") {
        return Ok(ServiceResponse {
            candidates: vec![Candidate {
                finish: FinishIndicator::Safety,
                text: None,
            }],
            usage: None,
            block_reason: None,
        });
    }
    Err(ServiceError::from_message(message))
}

#[async_trait]
impl ExtractionService for LlmProviderService {
    fn name(&self) -> &str {
        &self.label
    }

    async fn upload(&self, image: &Path) -> Result<RemoteFile, ServiceError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| ServiceError::new(ServiceErrorKind::Transport, format!("read image: {e}")))?;
        Ok(RemoteFile::Inline {
            data: to_base64(&bytes),
            mime_type: PNG_MIME.to_string(),
        })
    }

    async fn generate(
        &self,
        file: &RemoteFile,
        instruction: &str,
    ) -> Result<ServiceResponse, ServiceError> {
        let RemoteFile::Inline { data, mime_type } = file else {
            return Err(ServiceError::new(
                ServiceErrorKind::Decode,
                format!("{} only accepts inline images", self.label),
            ));
        };

        let image = ImageData::new(data.clone(), mime_type.as_str()).with_detail("high");
        let messages = vec![
            ChatMessage::system(TRANSCRIPTION_SYSTEM_PROMPT),
            ChatMessage::user_with_images(instruction, vec![image]),
        ];

        match self.provider.chat(&messages, Some(&self.options)).await {
            Ok(response) => {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    self.label, response.prompt_tokens, response.completion_tokens
                );
                Ok(response_from_completion(
                    response.content,
                    response.prompt_tokens as usize,
                    response.completion_tokens as usize,
                    self.max_tokens,
                ))
            }
            Err(e) => response_from_error(e.to_string()),
        }
    }

    async fn release(&self, _file: &RemoteFile) -> Result<(), ServiceError> {
        Ok(())
    }
}
