use crate::models::{ChunkMetadata, DocumentRecord};
use serde::{Deserialize, Serialize};

// Bounded relevance in (0, 1]; 1.0 only at zero distance.
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 / (1.0 + distance.max(0.0))
}

pub(crate) fn euclidean_distance(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = f64::from(*a) - f64::from(*b);
            delta * delta
        })
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl FieldValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            Self::Text(_) => None,
        }
    }
}

// Predicate over stored metadata fields.
// `Eq`, `And` and `Or` are understood by every backend; the range variants
// are only evaluated by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFilter {
    Eq { field: String, value: FieldValue },
    Gte { field: String, value: f64 },
    Lte { field: String, value: f64 },
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn any_of<I, V>(field: &str, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        let mut clauses = values
            .into_iter()
            .map(|value| Self::eq(field, value))
            .collect::<Vec<_>>();
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Self::Or(clauses)),
        }
    }

    pub fn all(mut clauses: Vec<Self>) -> Option<Self> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Self::And(clauses)),
        }
    }

    pub fn is_exact_match(&self) -> bool {
        match self {
            Self::Eq { .. } => true,
            Self::Gte { .. } | Self::Lte { .. } => false,
            Self::And(clauses) | Self::Or(clauses) => clauses.iter().all(Self::is_exact_match),
        }
    }

    pub fn matches<T: FilterFields + ?Sized>(&self, item: &T) -> bool {
        match self {
            Self::Eq { field, value } => item.field(field).as_ref() == Some(value),
            Self::Gte { field, value } => item
                .field(field)
                .and_then(|found| found.as_number())
                .is_some_and(|found| found >= *value),
            Self::Lte { field, value } => item
                .field(field)
                .and_then(|found| found.as_number())
                .is_some_and(|found| found <= *value),
            Self::And(clauses) => clauses.iter().all(|clause| clause.matches(item)),
            Self::Or(clauses) => clauses.iter().any(|clause| clause.matches(item)),
        }
    }
}

pub trait FilterFields {
    fn field(&self, name: &str) -> Option<FieldValue>;
}

impl FilterFields for ChunkMetadata {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "document_id" => Some(self.source.document_id.as_str().into()),
            "filename" => Some(self.source.filename.as_str().into()),
            "file_type" => Some(self.source.file_type.as_str().into()),
            "chunk_index" => Some(FieldValue::Number(self.chunk_index as f64)),
            "chunk_length" => Some(FieldValue::Number(self.chunk_length as f64)),
            "total_length" => Some(FieldValue::Number(self.source.total_length as f64)),
            _ => None,
        }
    }
}

impl FilterFields for DocumentRecord {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "document_id" => Some(self.document_id.as_str().into()),
            "filename" => Some(self.filename.as_str().into()),
            "file_type" => Some(self.file_type.as_str().into()),
            "document_type" | "ai_document_type" => {
                self.ai_document_type.as_deref().map(FieldValue::from)
            }
            "author" => self.author.as_deref().map(FieldValue::from),
            "title" => self.title.as_deref().map(FieldValue::from),
            "page_count" => self.page_count.map(FieldValue::from),
            "size_bytes" => Some(FieldValue::Number(self.size_bytes as f64)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub distance: f64,
}

impl ChunkHit {
    pub fn similarity(&self) -> f64 {
        similarity_from_distance(self.distance)
    }

    pub fn document_id(&self) -> &str {
        self.metadata.document_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub record: DocumentRecord,
    pub summary_text: Option<String>,
    pub summary_embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentEnrichment {
    pub ai_summary: Option<String>,
    pub ai_keywords: Option<Vec<String>>,
    pub ai_document_type: Option<String>,
    pub summary_text: Option<String>,
    pub summary_embedding: Option<Vec<f32>>,
}

impl DocumentEnrichment {
    pub fn apply_to(self, stored: &mut StoredDocument) {
        if let Some(summary) = self.ai_summary {
            stored.record.ai_summary = Some(summary);
        }
        if let Some(keywords) = self.ai_keywords {
            stored.record.set_keywords(keywords);
        }
        if let Some(document_type) = self.ai_document_type {
            stored.record.ai_document_type = Some(document_type);
        }
        stored.summary_text = self.summary_text;
        if self.summary_embedding.is_some() {
            stored.summary_embedding = self.summary_embedding;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHit {
    pub record: DocumentRecord,
    pub summary_text: Option<String>,
    pub similarity: f64,
}
