use super::snapshot::{load_json, write_json_atomic};
use crate::models::{Chunk, ChunkMetadata, DocumentRecord, StoreStatistics};
use crate::store::{
    euclidean_distance, ChunkHit, DocumentEnrichment, DocumentHit, MetadataFilter, StoredDocument,
};
use crate::traits::{ChunkIndex, DocumentStore};
use crate::SearchError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub(crate) fn chunk_point_id(metadata: &ChunkMetadata) -> String {
    format!("{}_chunk_{}", metadata.document_id(), metadata.chunk_index)
}

fn check_dimensions(expected: &[f32], actual: &[f32]) -> Result<(), SearchError> {
    if expected.len() != actual.len() {
        return Err(SearchError::Validation(format!(
            "embedding dimension {} does not match stored dimension {}",
            actual.len(),
            expected.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryChunkIndex {
    entries: RwLock<Vec<Chunk>>,
    snapshot: Option<PathBuf>,
}

impl InMemoryChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SearchError> {
        let path = path.into();
        let entries: Vec<Chunk> = load_json(&path).await?;
        info!(path = %path.display(), chunks = entries.len(), "chunk index loaded");
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, entries: &[Chunk]) -> Result<(), SearchError> {
        match &self.snapshot {
            Some(path) => write_json_atomic(path, entries).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChunkIndex for InMemoryChunkIndex {
    async fn upsert(
        &self,
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<usize, SearchError> {
        if texts.len() != embeddings.len() || texts.len() != metadatas.len() {
            return Err(SearchError::DimensionMismatch {
                chunks: texts.len(),
                embeddings: embeddings.len(),
                metadatas: metadatas.len(),
            });
        }
        if texts.is_empty() {
            return Ok(0);
        }

        let mut entries = self.entries.write().await;
        let reference = entries
            .first()
            .map(|entry| entry.embedding.clone())
            .unwrap_or_else(|| embeddings[0].clone());
        for embedding in embeddings {
            check_dimensions(&reference, embedding)?;
        }

        for ((text, embedding), metadata) in texts.iter().zip(embeddings).zip(metadatas) {
            let entry = Chunk {
                chunk_id: chunk_point_id(metadata),
                text: text.clone(),
                embedding: embedding.clone(),
                metadata: metadata.clone(),
            };
            match entries.iter_mut().find(|existing| existing.chunk_id == entry.chunk_id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        self.persist(&entries).await?;

        debug!(upserted = texts.len(), total = entries.len(), "chunks upserted");
        Ok(texts.len())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ChunkHit>, SearchError> {
        if let Some(filter) = filter.filter(|filter| !filter.is_exact_match()) {
            return Err(SearchError::Validation(format!(
                "chunk index accepts exact-match filters only, got {filter:?}"
            )));
        }

        let entries = self.entries.read().await;
        if let Some(first) = entries.first() {
            check_dimensions(&first.embedding, embedding)?;
        }

        let mut hits = entries
            .iter()
            .filter(|entry| filter.map_or(true, |filter| filter.matches(&entry.metadata)))
            .map(|entry| ChunkHit {
                chunk_id: entry.chunk_id.clone(),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                distance: euclidean_distance(&entry.embedding, embedding),
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, SearchError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.document_id() != document_id);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        info!(document_id, removed, "chunks deleted");
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, SearchError> {
        Ok(self.entries.read().await.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<Vec<StoredDocument>>,
    snapshot: Option<PathBuf>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SearchError> {
        let path = path.into();
        let documents: Vec<StoredDocument> = load_json(&path).await?;
        info!(path = %path.display(), documents = documents.len(), "document store loaded");
        Ok(Self {
            documents: RwLock::new(documents),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, documents: &[StoredDocument]) -> Result<(), SearchError> {
        match &self.snapshot {
            Some(path) => write_json_atomic(path, documents).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn put(
        &self,
        record: DocumentRecord,
        summary_embedding: Option<Vec<f32>>,
        summary_text: Option<String>,
    ) -> Result<(), SearchError> {
        let mut documents = self.documents.write().await;
        if let Some(embedding) = &summary_embedding {
            let reference = documents
                .iter()
                .filter(|stored| stored.record.document_id != record.document_id)
                .find_map(|stored| stored.summary_embedding.as_deref());
            if let Some(reference) = reference {
                check_dimensions(reference, embedding)?;
            }
        }

        let document_id = record.document_id.clone();
        let stored = StoredDocument {
            record,
            summary_text,
            summary_embedding,
        };
        match documents
            .iter_mut()
            .find(|existing| existing.record.document_id == document_id)
        {
            Some(existing) => *existing = stored,
            None => documents.push(stored),
        }
        self.persist(&documents).await?;

        debug!(document_id = %document_id, "document stored");
        Ok(())
    }

    async fn enrich(
        &self,
        document_id: &str,
        enrichment: DocumentEnrichment,
    ) -> Result<Option<DocumentRecord>, SearchError> {
        let mut documents = self.documents.write().await;
        if let Some(embedding) = &enrichment.summary_embedding {
            let reference = documents
                .iter()
                .filter(|stored| stored.record.document_id != document_id)
                .find_map(|stored| stored.summary_embedding.as_deref());
            if let Some(reference) = reference {
                check_dimensions(reference, embedding)?;
            }
        }

        let Some(stored) = documents
            .iter_mut()
            .find(|stored| stored.record.document_id == document_id)
        else {
            return Ok(None);
        };
        enrichment.apply_to(stored);
        let record = stored.record.clone();
        self.persist(&documents).await?;

        debug!(document_id, "document enriched");
        Ok(Some(record))
    }

    async fn get(&self, document_id: &str) -> Result<Option<StoredDocument>, SearchError> {
        Ok(self
            .documents
            .read()
            .await
            .iter()
            .find(|stored| stored.record.document_id == document_id)
            .cloned())
    }

    async fn list_all(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredDocument>, SearchError> {
        Ok(self
            .documents
            .read()
            .await
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_by_filter(
        &self,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, SearchError> {
        Ok(self
            .documents
            .read()
            .await
            .iter()
            .filter(|stored| filter.matches(&stored.record))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn semantic_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentHit>, SearchError> {
        let documents = self.documents.read().await;
        let mut scored = Vec::new();
        for stored in documents.iter() {
            let Some(summary_embedding) = stored.summary_embedding.as_deref() else {
                continue;
            };
            if !filter.map_or(true, |filter| filter.matches(&stored.record)) {
                continue;
            }
            check_dimensions(summary_embedding, embedding)?;
            scored.push((euclidean_distance(summary_embedding, embedding), stored));
        }

        scored.sort_by(|(left_distance, left), (right_distance, right)| {
            left_distance
                .total_cmp(right_distance)
                .then_with(|| left.record.document_id.cmp(&right.record.document_id))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(distance, stored)| DocumentHit {
                record: stored.record.clone(),
                summary_text: stored.summary_text.clone(),
                similarity: crate::store::similarity_from_distance(distance),
            })
            .collect())
    }

    async fn delete(&self, document_id: &str) -> Result<bool, SearchError> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|stored| stored.record.document_id != document_id);
        let removed = documents.len() != before;
        if removed {
            self.persist(&documents).await?;
        }
        Ok(removed)
    }

    async fn statistics(&self) -> Result<StoreStatistics, SearchError> {
        let documents = self.documents.read().await;
        let mut statistics = StoreStatistics {
            total_documents: documents.len(),
            ..StoreStatistics::default()
        };
        let mut total_bytes = 0u64;
        for stored in documents.iter() {
            let record = &stored.record;
            total_bytes += record.size_bytes;
            let file_type = if record.file_type.is_empty() {
                "unknown"
            } else {
                record.file_type.as_str()
            };
            *statistics
                .file_type_distribution
                .entry(file_type.to_string())
                .or_default() += 1;
            let document_type = record.ai_document_type.as_deref().unwrap_or("unknown");
            *statistics
                .document_type_distribution
                .entry(document_type.to_string())
                .or_default() += 1;
        }
        statistics.total_size_mb =
            (total_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
        Ok(statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkSource;

    fn metadata(document_id: &str, chunk_index: usize) -> ChunkMetadata {
        ChunkMetadata {
            source: ChunkSource {
                document_id: document_id.to_string(),
                filename: format!("{document_id}.txt"),
                file_type: ".txt".to_string(),
                total_length: 100,
            },
            chunk_index,
            chunk_length: 5,
        }
    }

    async fn seeded_index() -> InMemoryChunkIndex {
        let index = InMemoryChunkIndex::new();
        index
            .upsert(
                &["alpha".to_string(), "beta".to_string(), "gamma".to_string()],
                &[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 3.0]],
                &[metadata("doc-a", 0), metadata("doc-a", 1), metadata("doc-b", 0)],
            )
            .await
            .expect("upsert");
        index
    }

    #[tokio::test]
    async fn upsert_rejects_mismatched_lengths() {
        let index = InMemoryChunkIndex::new();
        let error = index
            .upsert(&["one".to_string()], &[], &[metadata("doc-a", 0)])
            .await
            .expect_err("lengths differ");
        assert!(matches!(
            error,
            SearchError::DimensionMismatch {
                chunks: 1,
                embeddings: 0,
                metadatas: 1
            }
        ));
    }

    #[tokio::test]
    async fn query_is_capped_at_index_size_and_ordered_by_distance() {
        let index = seeded_index().await;
        let hits = index.query(&[0.0, 0.0], 50, None).await.expect("query");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].text, "alpha");
        assert_eq!(hits[0].similarity(), 1.0);
        assert!(hits[1].similarity() > hits[2].similarity());
    }

    #[tokio::test]
    async fn query_applies_exact_filters_and_rejects_ranges() {
        let index = seeded_index().await;
        let filter = MetadataFilter::eq("document_id", "doc-b");
        let hits = index.query(&[0.0, 0.0], 10, Some(&filter)).await.expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id(), "doc-b");

        let range = MetadataFilter::Gte {
            field: "chunk_index".to_string(),
            value: 1.0,
        };
        let error = index
            .query(&[0.0, 0.0], 10, Some(&range))
            .await
            .expect_err("range filters are rejected");
        assert!(matches!(error, SearchError::Validation(_)));
    }

    #[tokio::test]
    async fn upsert_replaces_same_chunk_id() {
        let index = seeded_index().await;
        index
            .upsert(&["alpha v2".to_string()], &[vec![0.0, 0.0]], &[metadata("doc-a", 0)])
            .await
            .expect("upsert");
        assert_eq!(index.count().await.expect("count"), 3);
        let hits = index.query(&[0.0, 0.0], 1, None).await.expect("query");
        assert_eq!(hits[0].text, "alpha v2");
    }

    #[tokio::test]
    async fn delete_by_document_removes_every_chunk() {
        let index = seeded_index().await;
        assert_eq!(index.delete_by_document("doc-a").await.expect("delete"), 2);
        let hits = index.query(&[0.0, 0.0], 10, None).await.expect("query");
        assert!(hits.iter().all(|hit| hit.document_id() != "doc-a"));
    }

    #[tokio::test]
    async fn chunk_index_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chunks.json");
        {
            let index = InMemoryChunkIndex::open(&path).await.expect("open");
            index
                .upsert(&["kept".to_string()], &[vec![1.0]], &[metadata("doc-a", 0)])
                .await
                .expect("upsert");
        }
        let reopened = InMemoryChunkIndex::open(&path).await.expect("reopen");
        assert_eq!(reopened.count().await.expect("count"), 1);
    }

    fn record(id: &str, file_type: &str, pages: u32) -> DocumentRecord {
        let mut record = DocumentRecord::new(id, format!("{id}{file_type}"));
        record.page_count = Some(pages);
        record.size_bytes = 1024 * 1024;
        record
    }

    #[tokio::test]
    async fn document_store_lists_in_insertion_order() {
        let store = InMemoryDocumentStore::new();
        for id in ["c", "a", "b"] {
            store.put(record(id, ".pdf", 1), None, None).await.expect("put");
        }
        store.put(record("a", ".pdf", 9), None, None).await.expect("update");
        let listed = store.list_all(10, 1).await.expect("list");
        let ids = listed
            .iter()
            .map(|stored| stored.record.document_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(listed[0].record.page_count, Some(9));
    }

    #[tokio::test]
    async fn semantic_search_skips_documents_without_embeddings() {
        let store = InMemoryDocumentStore::new();
        store
            .put(record("near", ".pdf", 2), Some(vec![0.0, 0.0]), Some("near".to_string()))
            .await
            .expect("put");
        store
            .put(record("far", ".docx", 8), Some(vec![3.0, 4.0]), None)
            .await
            .expect("put");
        store
            .put(record("text-only", ".pdf", 2), None, Some("text only".to_string()))
            .await
            .expect("put");

        let hits = store.semantic_search(&[0.0, 0.0], 10, None).await.expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.document_id, "near");
        assert!((hits[1].similarity - 1.0 / 6.0).abs() < 1e-9);

        let filter = MetadataFilter::And(vec![
            MetadataFilter::eq("file_type", ".docx"),
            MetadataFilter::Gte {
                field: "page_count".to_string(),
                value: 5.0,
            },
        ]);
        let filtered = store
            .semantic_search(&[0.0, 0.0], 10, Some(&filter))
            .await
            .expect("search");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].record.document_id, "far");
    }

    #[tokio::test]
    async fn statistics_scan_all_records() {
        let store = InMemoryDocumentStore::new();
        store.put(record("a", ".pdf", 1), None, None).await.expect("put");
        store.put(record("b", ".pdf", 1), None, None).await.expect("put");
        store.put(record("c", ".docx", 1), None, None).await.expect("put");
        let statistics = store.statistics().await.expect("stats");
        assert_eq!(statistics.total_documents, 3);
        assert_eq!(statistics.file_type_distribution.get(".pdf"), Some(&2));
        assert_eq!(statistics.document_type_distribution.get("unknown"), Some(&3));
        assert_eq!(statistics.total_size_mb, 3.0);
    }

    #[tokio::test]
    async fn deleted_documents_are_gone() {
        let store = InMemoryDocumentStore::new();
        store.put(record("a", ".pdf", 1), Some(vec![1.0]), None).await.expect("put");
        assert!(store.delete("a").await.expect("delete"));
        assert!(!store.delete("a").await.expect("delete again"));
        assert!(store.get("a").await.expect("get").is_none());
        assert!(store
            .semantic_search(&[1.0], 5, None)
            .await
            .expect("search")
            .is_empty());
    }
}
