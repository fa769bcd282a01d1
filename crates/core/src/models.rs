use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChunkSource {
    pub document_id: String,
    pub filename: String,
    pub file_type: String,
    pub total_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChunkMetadata {
    #[serde(flatten)]
    pub source: ChunkSource,
    pub chunk_index: usize,
    pub chunk_length: usize,
}

impl ChunkMetadata {
    pub fn document_id(&self) -> &str {
        &self.source.document_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn document_id(&self) -> &str {
        self.metadata.document_id()
    }

    pub fn chunk_index(&self) -> usize {
        self.metadata.chunk_index
    }

    pub fn char_length(&self) -> usize {
        self.metadata.chunk_length
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub document_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_type: String,
    pub size_bytes: u64,
    pub page_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub ai_keywords: Vec<String>,
    pub ai_document_type: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl DocumentRecord {
    pub fn new(document_id: impl Into<String>, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        let filename = filename.into();
        Self {
            document_id: document_id.into(),
            file_type: extension_of(&filename),
            file_path: filename.clone(),
            filename,
            size_bytes: 0,
            page_count: None,
            created_at: now,
            modified_at: now,
            title: None,
            author: None,
            ai_summary: None,
            ai_keywords: Vec::new(),
            ai_document_type: None,
            tags: BTreeSet::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn size_mb(&self) -> f64 {
        let mb = self.size_bytes as f64 / (1024.0 * 1024.0);
        (mb * 100.0).round() / 100.0
    }

    pub fn set_keywords<I, S>(&mut self, keywords: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        self.ai_keywords = keywords
            .into_iter()
            .map(Into::into)
            .filter(|keyword| seen.insert(keyword.clone()))
            .collect();
    }

    pub fn display_name(&self) -> &str {
        display_name(&self.filename)
    }
}

pub fn display_name(filename: &str) -> &str {
    const PREFIX_LEN: usize = 37;
    if filename.len() <= PREFIX_LEN || !filename.is_char_boundary(PREFIX_LEN) {
        return filename;
    }
    let (prefix, rest) = filename.split_at(PREFIX_LEN);
    match prefix.strip_suffix('_') {
        Some(candidate) if uuid::Uuid::try_parse(candidate).is_ok() && candidate.contains('-') => {
            rest
        }
        _ => filename,
    }
}

pub(crate) fn snippet(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

pub(crate) fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRelevance {
    pub chunk_id: String,
    pub text: String,
    pub similarity_score: f64,
    pub chunk_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    #[serde(flatten)]
    pub document: DocumentRecord,
    pub display_name: String,
    pub preview_snippet: Option<String>,
    pub document_score: Option<f64>,
    pub chunk_score: Option<f64>,
    pub aggregated_score: Option<f64>,
    #[serde(default)]
    pub relevant_chunks: Vec<ChunkRelevance>,
}

impl SearchResult {
    pub fn document_id(&self) -> &str {
        &self.document.document_id
    }

    pub fn relevance(&self) -> f64 {
        self.aggregated_score
            .or(self.document_score)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Relevance,
    Filename,
    CreatedAt,
    ModifiedAt,
    Size,
    PageCount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub top_k: usize,
    pub filename_contains: Option<String>,
    pub file_types: Vec<String>,
    pub document_types: Vec<String>,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub min_pages: Option<u32>,
    pub max_pages: Option<u32>,
    pub min_size_mb: Option<f64>,
    pub max_size_mb: Option<f64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub sort_by: Option<SortField>,
    pub sort_order: SortOrder,
    pub include_chunk_scores: bool,
    pub use_doc_level_ranking: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            top_k: 10,
            filename_contains: None,
            file_types: Vec::new(),
            document_types: Vec::new(),
            authors: Vec::new(),
            tags: Vec::new(),
            keywords: Vec::new(),
            min_pages: None,
            max_pages: None,
            min_size_mb: None,
            max_size_mb: None,
            created_after: None,
            created_before: None,
            modified_after: None,
            modified_before: None,
            sort_by: None,
            sort_order: SortOrder::Desc,
            include_chunk_scores: false,
            use_doc_level_ranking: true,
        }
    }
}

impl SearchRequest {
    pub fn with_query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn query_text(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }

    pub fn has_filters(&self) -> bool {
        self.filename_contains
            .as_deref()
            .is_some_and(|value| !value.is_empty())
            || !self.file_types.is_empty()
            || !self.document_types.is_empty()
            || !self.authors.is_empty()
            || !self.tags.is_empty()
            || !self.keywords.is_empty()
            || self.min_pages.is_some()
            || self.max_pages.is_some()
            || self.min_size_mb.is_some()
            || self.max_size_mb.is_some()
            || self.created_after.is_some()
            || self.created_before.is_some()
            || self.modified_after.is_some()
            || self.modified_before.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Metadata,
    Semantic,
    Hybrid,
}

impl SearchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub search_type: SearchType,
    pub total_results: usize,
    pub processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<QueryClassification>,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarDocuments {
    pub source_document_id: String,
    pub source_filename: String,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Metadata,
    Content,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExtractedFilters {
    pub years: BTreeSet<String>,
    pub months: BTreeSet<String>,
    pub quarters: BTreeSet<String>,
    pub authors: BTreeSet<String>,
    pub file_types: BTreeSet<String>,
}

impl ExtractedFilters {
    pub fn non_empty_groups(&self) -> usize {
        [
            &self.years,
            &self.months,
            &self.quarters,
            &self.authors,
            &self.file_types,
        ]
        .iter()
        .filter(|group| !group.is_empty())
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.non_empty_groups() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryClassification {
    pub query_type: QueryType,
    pub confidence: f64,
    pub metadata_indicators: BTreeSet<String>,
    pub content_indicators: BTreeSet<String>,
    pub extracted_filters: ExtractedFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FileInfo {
    #[serde(rename = "type")]
    pub file_type: String,
    pub size_mb: f64,
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DocumentDates {
    pub created: String,
    pub modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Authorship {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Classification {
    pub document_type: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetadataSummary {
    pub file_info: FileInfo,
    pub dates: DocumentDates,
    pub authorship: Authorship,
    pub classification: Classification,
}

impl From<&DocumentRecord> for MetadataSummary {
    fn from(record: &DocumentRecord) -> Self {
        Self {
            file_info: FileInfo {
                file_type: record.file_type.clone(),
                size_mb: record.size_mb(),
                page_count: record.page_count,
            },
            dates: DocumentDates {
                created: record.created_at.to_rfc3339(),
                modified: record.modified_at.to_rfc3339(),
            },
            authorship: Authorship {
                title: record.title.clone(),
                author: record.author.clone(),
            },
            classification: Classification {
                document_type: record.ai_document_type.clone(),
                keywords: record.ai_keywords.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub document_id: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub metadata_summary: MetadataSummary,
    pub generated_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartSummary {
    pub document_id: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub metadata_summary: MetadataSummary,
    pub cached: bool,
    pub generated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub similarity_score: f64,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreStatistics {
    pub total_documents: usize,
    pub file_type_distribution: BTreeMap<String, usize>,
    pub document_type_distribution: BTreeMap<String, usize>,
    pub total_size_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_strips_uuid_prefix() {
        let stored = "a1b2c3d4-e5f6-7890-abcd-ef1234567890_report.pdf";
        assert_eq!(display_name(stored), "report.pdf");
        assert_eq!(display_name("report.pdf"), "report.pdf");
        assert_eq!(display_name("not-a-uuid-at-all-but-long-enough-x_report.pdf"), "not-a-uuid-at-all-but-long-enough-x_report.pdf");
    }

    #[test]
    fn keywords_keep_first_occurrence_order() {
        let mut record = DocumentRecord::new("doc-1", "a.pdf");
        record.set_keywords(["revenue", "growth", "revenue", "q4"]);
        assert_eq!(record.ai_keywords, vec!["revenue", "growth", "q4"]);
    }

    #[test]
    fn filters_are_detected_on_request() {
        let mut request = SearchRequest::with_query("revenue");
        assert!(!request.has_filters());
        request.min_pages = Some(3);
        assert!(request.has_filters());
        assert_eq!(SearchRequest::with_query("   ").query_text(), None);
    }

    #[test]
    fn relevance_falls_back_to_document_score() {
        let result = SearchResult {
            document: DocumentRecord::new("doc-1", "a.pdf"),
            display_name: "a.pdf".to_string(),
            preview_snippet: None,
            document_score: Some(0.4),
            chunk_score: None,
            aggregated_score: None,
            relevant_chunks: Vec::new(),
        };
        assert_eq!(result.relevance(), 0.4);
    }

    #[test]
    fn snippets_mark_truncation() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("exactly", 7), "exactly");
        assert_eq!(snippet("ééééé", 2), "éé...");
    }

    #[test]
    fn size_is_rounded_to_two_decimals() {
        let mut record = DocumentRecord::new("doc-1", "a.PDF");
        record.size_bytes = 2_621_440;
        assert_eq!(record.size_mb(), 2.5);
        assert_eq!(record.file_type, ".pdf");
    }
}
