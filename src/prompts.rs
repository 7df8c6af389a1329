//! Instruction text sent to the extraction service.
//!
//! Kept in one place so a wording change never touches the request or
//! outcome-classification code. Callers override it through
//! [`crate::config::ExtractionConfig::instruction`].

/// Default single-turn instruction: verbatim plain-text transcription.
pub const DEFAULT_INSTRUCTION: &str = "Please convert the content of this image to plain text.";

/// System prompt used by chat-style providers that separate system and user
/// turns (the `edgequake-llm` backend). Gemini receives only the instruction.
pub const TRANSCRIPTION_SYSTEM_PROMPT: &str = r#"You are a meticulous OCR engine transcribing scanned archival pages.

Rules:
- Transcribe ALL visible text verbatim, in reading order
- Keep original spelling, capitalisation and punctuation, including errors
- Preserve line breaks between paragraphs; do not re-flow columns into one another
- Do NOT summarise, translate, annotate or add commentary
- Do NOT wrap the output in code fences or Markdown
- If the page is blank, answer with an empty message"#;
