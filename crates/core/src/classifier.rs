use crate::error::SearchError;
use crate::models::{ExtractedFilters, QueryClassification, QueryType};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::info;

const METADATA_KEYWORDS: &[&str] = &[
    "file", "files", "document", "documents", "pdf", "docx", "doc",
    "invoice", "invoices", "contract", "contracts", "report", "reports",
    "presentation", "presentations", "spreadsheet", "spreadsheets",
    "resume", "resumes", "letter", "letters", "memo", "memos",
    "manual", "manuals", "guide", "guides",
    "by", "from", "author", "authored", "created by", "written by",
    "dated", "created", "modified", "uploaded", "in", "during",
    "page", "pages", "size", "larger", "smaller", "contains",
    "list", "show", "find", "filter", "search for", "get all",
    "display", "retrieve", "fetch",
    "how many", "total", "count", "statistics", "stats",
];

const CONTENT_KEYWORDS: &[&str] = &[
    "what", "how", "why", "when", "where", "which", "who",
    "explain", "describe", "tell me", "define", "summarize",
    "clarify", "elaborate", "detail",
    "says", "mentions", "discusses", "covers", "about",
    "regarding", "concerning", "related to",
    "mean", "meaning", "understand", "interpretation",
];

const NO_SIGNAL_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct QueryClassifier {
    year: Regex,
    months: Vec<Regex>,
    quarter: Regex,
    authors: Vec<Regex>,
    file_types: Vec<Regex>,
}

impl QueryClassifier {
    pub fn new() -> Result<Self, SearchError> {
        Ok(Self {
            year: Regex::new(r"\b(20\d{2})\b")?,
            months: vec![
                Regex::new(
                    r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\b",
                )?,
                Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)\b")?,
            ],
            quarter: Regex::new(r"(?i)\b(q[1-4]|quarter [1-4])\b")?,
            authors: vec![
                Regex::new(r"\bby\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b")?,
                Regex::new(r"\bfrom\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b")?,
                Regex::new(r"\bauthor[ed]*\s+by\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b")?,
            ],
            file_types: vec![
                Regex::new(r"(?i)\b(pdf|docx|doc)\s+files?\b")?,
                Regex::new(r"(?i)\b\.(pdf|docx|doc)\b")?,
            ],
        })
    }

    pub fn classify(&self, query: &str) -> QueryClassification {
        let words = words_of(query);
        let metadata_indicators = matching_keywords(&words, METADATA_KEYWORDS);
        let content_indicators = matching_keywords(&words, CONTENT_KEYWORDS);
        let extracted_filters = self.extract_filters(query);

        let metadata_score = metadata_indicators.len() + 2 * extracted_filters.non_empty_groups();
        let content_score = content_indicators.len();

        let (query_type, confidence) = match (metadata_score, content_score) {
            (0, 0) => (QueryType::Content, NO_SIGNAL_CONFIDENCE),
            (metadata, 0) => (
                QueryType::Metadata,
                MAX_CONFIDENCE.min(0.5 + 0.1 * metadata as f64),
            ),
            (0, content) => (
                QueryType::Content,
                MAX_CONFIDENCE.min(0.5 + 0.1 * content as f64),
            ),
            (metadata, content) => (
                QueryType::Hybrid,
                MAX_CONFIDENCE.min(0.6 + 0.05 * (metadata + content) as f64),
            ),
        };

        info!(
            query_type = ?query_type,
            confidence = format_args!("{confidence:.2}"),
            metadata_score,
            content_score,
            "query classified"
        );

        QueryClassification {
            query_type,
            confidence,
            metadata_indicators,
            content_indicators,
            extracted_filters,
        }
    }

    fn extract_filters(&self, query: &str) -> ExtractedFilters {
        let mut filters = ExtractedFilters::default();

        filters.years = captures(&self.year, query).collect();
        filters.months = self
            .months
            .iter()
            .flat_map(|regex| captures(regex, query))
            .map(|month| month.to_lowercase())
            .collect();
        filters.quarters = captures(&self.quarter, query)
            .map(|quarter| quarter.to_lowercase())
            .collect();
        filters.authors = self
            .authors
            .iter()
            .flat_map(|regex| captures(regex, query))
            .collect();
        filters.file_types = self
            .file_types
            .iter()
            .flat_map(|regex| captures(regex, query))
            .map(|kind| kind.to_lowercase().replace('.', ""))
            .collect();

        filters
    }
}

fn captures<'r, 'q>(regex: &'r Regex, query: &'q str) -> impl Iterator<Item = String> + 'r
where
    'q: 'r,
{
    regex
        .captures_iter(query)
        .filter_map(|capture| capture.get(1).map(|m| m.as_str().to_string()))
}

fn words_of(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

fn matching_keywords(words: &[String], keywords: &[&str]) -> BTreeSet<String> {
    keywords
        .iter()
        .filter(|keyword| {
            let phrase = keyword.split_whitespace().collect::<Vec<_>>();
            words
                .windows(phrase.len())
                .any(|window| window.iter().zip(&phrase).all(|(word, part)| word == part))
        })
        .map(|keyword| keyword.to_string())
        .collect()
}
