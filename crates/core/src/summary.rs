use crate::error::bounded;
use crate::models::{snippet, CacheEntry, DocumentRecord, MetadataSummary, SmartSummary};
use crate::stores::{load_json, write_json_atomic};
use crate::traits::{GenerationParams, LlmProvider};
use crate::SearchError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub const CACHE_FILE_NAME: &str = "summary_cache.json";
pub const CACHE_VERSION: &str = "1.0";

const RAW_SUMMARY_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub cache_file: String,
    pub cache_size_kb: f64,
}

type Entries = BTreeMap<String, CacheEntry>;

pub struct SummaryCache {
    path: PathBuf,
    entries: Arc<RwLock<Entries>>,
}

impl SummaryCache {
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(CACHE_FILE_NAME);
        let entries = match load_json::<Entries>(&path).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load summary cache");
                BTreeMap::new()
            }
        };
        info!(entries = entries.len(), "summary cache initialized");
        Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, document_id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(document_id).cloned()
    }

    pub async fn set(
        &self,
        document_id: &str,
        summary: String,
        key_topics: Vec<String>,
        metadata_summary: MetadataSummary,
    ) -> Result<CacheEntry, SearchError> {
        let entry = CacheEntry {
            document_id: document_id.to_string(),
            summary,
            key_topics,
            metadata_summary,
            generated_at: Utc::now(),
            version: CACHE_VERSION.to_string(),
        };

        let staged = entry.clone();
        self.persist_change(move |entries| {
            entries.insert(staged.document_id.clone(), staged);
        })
        .await?;

        info!(document_id, "cached summary");
        Ok(entry)
    }

    pub async fn invalidate(&self, document_id: &str) -> Result<bool, SearchError> {
        if !self.entries.read().await.contains_key(document_id) {
            return Ok(false);
        }
        let key = document_id.to_string();
        let removed = self
            .persist_change(move |entries| entries.remove(&key).is_some())
            .await?;
        if removed {
            info!(document_id, "invalidated cached summary");
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), SearchError> {
        self.persist_change(|entries| entries.clear()).await?;
        info!("summary cache cleared");
        Ok(())
    }

    // Applies `change` to a copy of the entries, writes the copy and only
    // then swaps it in. The write runs on its own task so a dropped caller
    // cannot leave memory and file disagreeing.
    async fn persist_change<T, F>(&self, change: F) -> Result<T, SearchError>
    where
        F: FnOnce(&mut Entries) -> T + Send + 'static,
        T: Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut current = entries.write_owned().await;
            let mut staged = current.clone();
            let outcome = change(&mut staged);
            write_json_atomic(&path, &staged).await?;
            *current = staged;
            Ok::<_, SearchError>(outcome)
        })
        .await
        .map_err(|err| SearchError::dependency("summary cache", err.to_string()))?
    }

    pub async fn stats(&self) -> CacheStats {
        let total_entries = self.entries.read().await.len();
        let cache_size_kb = tokio::fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.len() as f64 / 1024.0)
            .unwrap_or(0.0);
        CacheStats {
            total_entries,
            cache_file: self.path.display().to_string(),
            cache_size_kb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryOptions {
    pub preview_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            preview_chars: 3000,
            temperature: 0.3,
            max_tokens: 500,
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct SummaryGenerator<L: ?Sized> {
    llm: Arc<L>,
    cache: Arc<SummaryCache>,
    options: SummaryOptions,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<L> SummaryGenerator<L>
where
    L: LlmProvider + ?Sized,
{
    pub fn new(llm: Arc<L>, cache: Arc<SummaryCache>, options: SummaryOptions) -> Self {
        Self {
            llm,
            cache,
            options,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<SummaryCache> {
        &self.cache
    }

    pub async fn generate(
        &self,
        record: &DocumentRecord,
        content_preview: &str,
        force_regenerate: bool,
    ) -> SmartSummary {
        let document_id = record.document_id.as_str();
        if !force_regenerate {
            if let Some(entry) = self.cache.get(document_id).await {
                info!(document_id, "returning cached summary");
                return from_entry(entry, true);
            }
        }

        let key_lock = self.key_lock(document_id);
        let guard = key_lock.lock().await;

        let summary = match self.cache.get(document_id).await {
            Some(entry) if !force_regenerate => from_entry(entry, true),
            _ => self.generate_locked(record, content_preview).await,
        };

        drop(guard);
        self.release_key(document_id, &key_lock);
        summary
    }

    async fn generate_locked(&self, record: &DocumentRecord, content_preview: &str) -> SmartSummary {
        let prompt = build_summary_prompt(record, content_preview, self.options.preview_chars);
        let params = GenerationParams {
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        let response = bounded(
            "llm",
            self.options.timeout,
            self.llm.generate(&prompt, params),
        )
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(document_id = %record.document_id, error = %err, "failed to generate summary");
                return fallback_summary(record, err.to_string());
            }
        };

        let (summary, key_topics) = parse_summary_response(&response);
        let metadata_summary = MetadataSummary::from(record);
        match self
            .cache
            .set(
                &record.document_id,
                summary.clone(),
                key_topics.clone(),
                metadata_summary.clone(),
            )
            .await
        {
            Ok(entry) => from_entry(entry, false),
            Err(err) => {
                warn!(document_id = %record.document_id, error = %err, "summary not persisted");
                SmartSummary {
                    document_id: record.document_id.clone(),
                    summary,
                    key_topics,
                    metadata_summary,
                    cached: false,
                    generated_at: Utc::now(),
                    error: None,
                }
            }
        }
    }

    fn key_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(in_flight.entry(document_id.to_string()).or_default())
    }

    fn release_key(&self, document_id: &str, key_lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // map + this caller; anyone else still queued keeps the lock alive
        if Arc::strong_count(key_lock) <= 2 {
            in_flight.remove(document_id);
        }
    }

    #[cfg(test)]
    fn in_flight_keys(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn from_entry(entry: CacheEntry, cached: bool) -> SmartSummary {
    SmartSummary {
        document_id: entry.document_id,
        summary: entry.summary,
        key_topics: entry.key_topics,
        metadata_summary: entry.metadata_summary,
        cached,
        generated_at: entry.generated_at,
        error: None,
    }
}

fn fallback_summary(record: &DocumentRecord, error: String) -> SmartSummary {
    let existing = record
        .ai_summary
        .as_deref()
        .filter(|summary| !summary.trim().is_empty())
        .unwrap_or("Summary not available.");
    SmartSummary {
        document_id: record.document_id.clone(),
        summary: format!("Document: {}. {existing}", record.filename),
        key_topics: Vec::new(),
        metadata_summary: MetadataSummary::from(record),
        cached: false,
        generated_at: Utc::now(),
        error: Some(error),
    }
}

pub fn build_summary_prompt(
    record: &DocumentRecord,
    content_preview: &str,
    preview_chars: usize,
) -> String {
    let page_count = record
        .page_count
        .map(|pages| pages.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let keywords = if record.ai_keywords.is_empty() {
        "None".to_string()
    } else {
        record.ai_keywords.join(", ")
    };
    let file_type = if record.file_type.is_empty() {
        "unknown"
    } else {
        record.file_type.as_str()
    };

    format!(
        "Generate a comprehensive yet concise summary of this document.

Document Information:
- Filename: {filename}
- File Type: {file_type}
- Page Count: {page_count}
- Author: {author}
- Title: {title}
- Document Type: {document_type}
- Existing Keywords: {keywords}

Content Preview:
{preview}

Please provide:
1. A clear, 2-3 sentence summary of what this document is about
2. 3-5 key topics or themes covered in the document

Format your response as:
SUMMARY: [Your summary here]
KEY_TOPICS: [topic1], [topic2], [topic3], ...
",
        filename = record.filename,
        author = record.author.as_deref().unwrap_or("Unknown"),
        title = record.title.as_deref().unwrap_or("Untitled"),
        document_type = record.ai_document_type.as_deref().unwrap_or("Unknown"),
        preview = snippet(content_preview, preview_chars),
    )
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.get(..label.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(label))
        .map(|_| line[label.len()..].trim())
}

pub fn parse_summary_response(response: &str) -> (String, Vec<String>) {
    let mut summary = None;
    let mut key_topics = Vec::new();

    for line in response.trim().lines() {
        let line = line.trim();
        if let Some(text) = strip_label(line, "SUMMARY:") {
            summary = Some(text.to_string());
        } else if let Some(topics) =
            strip_label(line, "KEY_TOPICS:").or_else(|| strip_label(line, "KEY TOPICS:"))
        {
            key_topics = topics
                .split(',')
                .map(|topic| topic.trim().trim_matches(|ch| ch == '[' || ch == ']').trim())
                .filter(|topic| !topic.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    let summary = match summary {
        Some(summary) => summary,
        None => snippet(response.trim(), RAW_SUMMARY_CHARS),
    };
    (summary, key_topics)
}
