//! Gemini Developer API backend for [`ExtractionService`].
//!
//! Each page goes through the Files API: a resumable upload registers the
//! PNG and returns a `files/<id>` resource, `generateContent` references it
//! by URI, and a `DELETE` releases it. Errors are mapped to
//! [`ServiceErrorKind`] from the HTTP status and the `error.status` field of
//! the JSON body, so rate limiting is recognised without string matching.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::pipeline::encode::PNG_MIME;
use crate::pipeline::service::{
    Candidate, ExtractionService, FinishIndicator, RemoteFile, RemoteUpload, ServiceError,
    ServiceErrorKind, ServiceResponse, UsageMetadata,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini client for one model and generation configuration.
pub struct GeminiService {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    generation: GenerationConfig,
}

impl GeminiService {
    /// Create a client from `config`.
    ///
    /// # Errors
    /// [`PipelineError::ServiceNotConfigured`] when no API key is set or the
    /// HTTP client cannot be built.
    pub fn new(config: &ExtractionConfig) -> Result<Self, PipelineError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::ServiceNotConfigured {
                service: "gemini".into(),
                hint: "Set GEMINI_API_KEY or pass --api-key.".into(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::ServiceNotConfigured {
                service: "gemini".into(),
                hint: format!("HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            generation: GenerationConfig::from(config),
        })
    }

    fn generate_endpoint(&self) -> String {
        let model = self.model.trim_start_matches("models/");
        format!("{}/v1beta/models/{}:generateContent", self.api_base, model)
    }

    async fn start_upload(&self, display_name: &str, size: usize) -> Result<String, ServiceError> {
        let body = UploadStart {
            file: UploadFileMeta {
                display_name: display_name.to_string(),
            },
        };
        let response = self
            .client
            .post(format!("{}/upload/v1beta/files", self.api_base))
            .header(API_KEY_HEADER, &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", PNG_MIME)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::new(ServiceErrorKind::Decode, "upload session without x-goog-upload-url")
            })
    }
}

#[async_trait]
impl ExtractionService for GeminiService {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn upload(&self, image: &Path) -> Result<RemoteFile, ServiceError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| ServiceError::new(ServiceErrorKind::Transport, format!("read image: {e}")))?;
        let display_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "page.png".into());

        let upload_url = self.start_upload(&display_name, bytes.len()).await?;
        let response = self
            .client
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let uploaded: UploadResponse = response.json().await.map_err(decode_error)?;
        debug!("Uploaded {} → {}", display_name, uploaded.file.name);
        Ok(RemoteFile::Uploaded {
            name: uploaded.file.name,
            uri: uploaded.file.uri,
            mime_type: uploaded.file.mime_type.unwrap_or_else(|| PNG_MIME.to_string()),
        })
    }

    async fn generate(
        &self,
        file: &RemoteFile,
        instruction: &str,
    ) -> Result<ServiceResponse, ServiceError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part::from_remote(file), Part::text(instruction)],
            }],
            generation_config: self.generation.clone(),
        };

        let response = self
            .client
            .post(self.generate_endpoint())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let body: GenerateResponse = response.json().await.map_err(decode_error)?;
        Ok(body.into())
    }

    async fn release(&self, file: &RemoteFile) -> Result<(), ServiceError> {
        let RemoteFile::Uploaded { name, .. } = file else {
            return Ok(());
        };
        let response = self
            .client
            .delete(format!("{}/v1beta/{}", self.api_base, name))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        debug!("Deleted {}", name);
        Ok(())
    }

    async fn list_uploads(&self) -> Result<Vec<RemoteUpload>, ServiceError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/v1beta/files", self.api_base))
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("pageSize", "100")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = check_status(request.send().await.map_err(transport_error)?).await?;
            let page: ListFilesResponse = response.json().await.map_err(decode_error)?;

            out.extend(page.files.into_iter().map(RemoteUpload::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(out)
    }
}

// ── Error mapping ────────────────────────────────────────────────────────

fn transport_error(e: reqwest::Error) -> ServiceError {
    match e.status() {
        Some(StatusCode::TOO_MANY_REQUESTS) => {
            ServiceError::new(ServiceErrorKind::RateLimited, e.to_string())
        }
        _ => ServiceError::new(ServiceErrorKind::Transport, e.to_string()),
    }
}

fn decode_error(e: reqwest::Error) -> ServiceError {
    ServiceError::new(ServiceErrorKind::Decode, e.to_string())
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), &body))
}

/// Map a non-success status and its body to a [`ServiceError`].
fn error_from_body(status: u16, body: &str) -> ServiceError {
    let detail: Option<ApiErrorDetail> = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|b| b.error);
    let api_status = detail.as_ref().and_then(|d| d.status.as_deref());
    let message = detail
        .as_ref()
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| body.trim().to_string());

    let kind = if status == 429 || api_status == Some("RESOURCE_EXHAUSTED") {
        ServiceErrorKind::RateLimited
    } else {
        ServiceErrorKind::Http { status }
    };
    ServiceError::new(kind, message)
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: String,
}

impl From<&ExtractionConfig> for GenerationConfig {
    fn from(c: &ExtractionConfig) -> Self {
        Self {
            temperature: c.temperature,
            top_p: c.top_p,
            top_k: c.top_k,
            max_output_tokens: c.max_output_tokens,
            response_mime_type: "text/plain".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    FileData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(rename = "fileUri")]
        file_uri: String,
    },
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
}

impl Part {
    fn text(s: &str) -> Self {
        Part::Text(s.to_string())
    }

    fn from_remote(file: &RemoteFile) -> Self {
        match file {
            RemoteFile::Uploaded { uri, mime_type, .. } => Part::FileData {
                mime_type: mime_type.clone(),
                file_uri: uri.clone(),
            },
            RemoteFile::Inline { data, mime_type } => Part::InlineData {
                mime_type: mime_type.clone(),
                data: data.clone(),
            },
        }
    }
}

#[derive(Serialize)]
struct UploadStart {
    file: UploadFileMeta,
}

#[derive(Serialize)]
struct UploadFileMeta {
    display_name: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    #[serde(default)]
    uri: String,
    mime_type: Option<String>,
    display_name: Option<String>,
    /// int64 is serialised as a JSON string.
    size_bytes: Option<String>,
    create_time: Option<String>,
}

impl From<FileResource> for RemoteUpload {
    fn from(f: FileResource) -> Self {
        Self {
            name: f.name,
            display_name: f.display_name,
            size_bytes: f.size_bytes.and_then(|s| s.parse().ok()),
            create_time: f.create_time,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesResponse {
    #[serde(default)]
    files: Vec<FileResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    usage_metadata: Option<ResponseUsage>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCandidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
    status: Option<String>,
}

impl From<GenerateResponse> for ServiceResponse {
    fn from(r: GenerateResponse) -> Self {
        let candidates = r
            .candidates
            .into_iter()
            .map(|c| {
                let text = c.content.and_then(|content| {
                    let joined: String = content.parts.into_iter().filter_map(|p| p.text).collect();
                    (!joined.is_empty()).then_some(joined)
                });
                // A candidate without finishReason is still streaming, which
                // a unary call never returns; treat it as a normal stop.
                let finish = c
                    .finish_reason
                    .as_deref()
                    .map(FinishIndicator::from_gemini)
                    .unwrap_or(FinishIndicator::Stop);
                Candidate { finish, text }
            })
            .collect();

        ServiceResponse {
            candidates,
            usage: r.usage_metadata.map(|u| UsageMetadata {
                prompt_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
            block_reason: r.prompt_feedback.and_then(|f| f.block_reason),
        }
    }
}
