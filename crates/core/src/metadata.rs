use crate::error::{bounded, IngestError};
use crate::models::{extension_of, DocumentRecord};
use crate::traits::{GenerationParams, LlmProvider};
use crate::SearchError;
use chrono::{DateTime, Utc};
use lopdf::{Document, Object};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

pub const DOCUMENT_TYPES: &[&str] = &[
    "invoice",
    "receipt",
    "contract",
    "agreement",
    "research_paper",
    "academic_paper",
    "report",
    "presentation",
    "memo",
    "letter",
    "email",
    "notes",
    "manual",
    "guide",
    "tutorial",
    "article",
    "blog_post",
    "whitepaper",
    "specification",
    "proposal",
    "resume",
    "cv",
    "form",
    "application",
    "other",
];

pub const SUMMARY_FAILED: &str = "Summary generation failed";

const EXTRA_INFO_KEYS: &[&str] = &["Subject", "Creator", "Producer", "Keywords"];

fn timestamp(time: std::io::Result<SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

pub fn extract_file_metadata(
    path: &Path,
    document_id: impl Into<String>,
) -> Result<DocumentRecord, IngestError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
    let stat = std::fs::metadata(path)?;

    let mut record = DocumentRecord::new(document_id, filename);
    record.file_path = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();
    record.file_type = extension_of(filename);
    record.size_bytes = stat.len();
    if let Some(modified) = timestamp(stat.modified()) {
        record.modified_at = modified;
        record.created_at = timestamp(stat.created()).unwrap_or(modified);
    }

    if record.file_type == ".pdf" {
        match Document::load(path) {
            Ok(document) => apply_pdf_properties(&document, &mut record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "pdf properties unreadable");
            }
        }
    }

    debug!(
        document_id = %record.document_id,
        file_type = %record.file_type,
        size_bytes = record.size_bytes,
        "file metadata extracted"
    );
    Ok(record)
}

fn apply_pdf_properties(document: &Document, record: &mut DocumentRecord) {
    record.page_count = Some(document.get_pages().len() as u32);

    let info = document
        .trailer
        .get(b"Info")
        .and_then(|reference| document.dereference(reference))
        .and_then(|(_, object)| object.as_dict());
    let Ok(info) = info else {
        return;
    };

    let read = |key: &str| {
        info.get(key.as_bytes())
            .ok()
            .and_then(|value| match value {
                Object::Reference(_) => document.dereference(value).ok().map(|(_, object)| object),
                other => Some(other),
            })
            .and_then(|value| match value {
                Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
                _ => None,
            })
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    record.title = read("Title");
    record.author = read("Author");
    for key in EXTRA_INFO_KEYS {
        if let Some(value) = read(key) {
            record.extra.insert(key.to_lowercase(), value);
        }
    }
}

pub fn decode_pdf_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&byte| byte as char).collect(),
    }
}

pub fn normalize_document_type(response: &str) -> String {
    let candidate = response.trim().to_lowercase().replace(' ', "_");
    if DOCUMENT_TYPES.contains(&candidate.as_str()) {
        return candidate;
    }
    DOCUMENT_TYPES
        .iter()
        .find(|known| !candidate.is_empty() && (candidate.contains(*known) || known.contains(candidate.as_str())))
        .map(|known| known.to_string())
        .unwrap_or_else(|| "other".to_string())
}

pub fn parse_keywords(response: &str, max_keywords: usize) -> Vec<String> {
    response
        .split(',')
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .take(max_keywords)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiMetadata {
    pub summary: String,
    pub keywords: Vec<String>,
    pub document_type: String,
    pub summary_generated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AiMetadataOptions {
    pub summary_words: usize,
    pub max_keywords: usize,
    pub sample_chars: usize,
    pub classification_sample_chars: usize,
    pub timeout: Duration,
}

impl Default for AiMetadataOptions {
    fn default() -> Self {
        Self {
            summary_words: 200,
            max_keywords: 10,
            sample_chars: 3000,
            classification_sample_chars: 2000,
            timeout: Duration::from_secs(120),
        }
    }
}

fn sample(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

pub struct AiMetadataGenerator<L: ?Sized> {
    llm: Arc<L>,
    options: AiMetadataOptions,
}

impl<L> AiMetadataGenerator<L>
where
    L: LlmProvider + ?Sized,
{
    pub fn new(llm: Arc<L>, options: AiMetadataOptions) -> Self {
        Self { llm, options }
    }

    async fn ask(&self, prompt: &str, params: GenerationParams) -> Result<String, SearchError> {
        bounded("llm", self.options.timeout, self.llm.generate(prompt, params)).await
    }

    pub async fn generate_summary(&self, text: &str) -> Result<String, SearchError> {
        let prompt = format!(
            "Analyze this document excerpt and provide a concise summary in {} words or less.\n\
             Focus on the main topic, purpose, and key points.\n\n\
             Document excerpt:\n{}\n\n\
             Provide only the summary, no preamble.",
            self.options.summary_words,
            sample(text, self.options.sample_chars)
        );
        let summary = self
            .ask(&prompt, GenerationParams { temperature: 0.3, max_tokens: 300 })
            .await?;
        info!(chars = summary.len(), "summary generated");
        Ok(summary.trim().to_string())
    }

    pub async fn generate_keywords(&self, text: &str) -> Result<Vec<String>, SearchError> {
        let prompt = format!(
            "Extract up to {} key topics, themes, or keywords from this document.\n\
             Return them as a comma-separated list of single words or short phrases.\n\n\
             Document excerpt:\n{}\n\n\
             Keywords (comma-separated only, no numbering or explanation)",
            self.options.max_keywords,
            sample(text, self.options.sample_chars)
        );
        let response = self
            .ask(&prompt, GenerationParams { temperature: 0.3, max_tokens: 150 })
            .await?;
        Ok(parse_keywords(&response, self.options.max_keywords))
    }

    pub async fn classify_document_type(
        &self,
        text: &str,
        filename: &str,
    ) -> Result<String, SearchError> {
        let prompt = format!(
            "Classify this document into ONE of these categories: {}\n\n\
             Filename: {}\n\n\
             Document excerpt:\n{}\n\n\
             Return ONLY the category name, nothing else.",
            DOCUMENT_TYPES.join(", "),
            filename,
            sample(text, self.options.classification_sample_chars)
        );
        let response = self
            .ask(&prompt, GenerationParams { temperature: 0.1, max_tokens: 20 })
            .await?;
        let document_type = normalize_document_type(&response);
        info!(document_type = %document_type, "document classified");
        Ok(document_type)
    }

    pub async fn generate_all(&self, text: &str, filename: &str) -> AiMetadata {
        let (summary, summary_generated) = match self.generate_summary(text).await {
            Ok(summary) => (summary, true),
            Err(err) => {
                error!(filename, error = %err, "failed to generate summary");
                (SUMMARY_FAILED.to_string(), false)
            }
        };
        let keywords = self.generate_keywords(text).await.unwrap_or_else(|err| {
            error!(filename, error = %err, "failed to generate keywords");
            Vec::new()
        });
        let document_type = self
            .classify_document_type(text, filename)
            .await
            .unwrap_or_else(|err| {
                error!(filename, error = %err, "failed to classify document");
                "other".to_string()
            });

        AiMetadata {
            summary,
            keywords,
            document_type,
            summary_generated,
        }
    }
}
