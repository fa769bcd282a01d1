use crate::models::{ChunkMetadata, DocumentRecord, StoreStatistics};
use crate::store::{ChunkHit, DocumentEnrichment, DocumentHit, MetadataFilter, StoredDocument};
use crate::SearchError;
use async_trait::async_trait;

#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn upsert(
        &self,
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<usize, SearchError>;

    // Nearest chunks by distance, at most `min(top_k, count)` of them.
    // Only exact-match filters are accepted.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ChunkHit>, SearchError>;

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, SearchError>;

    async fn count(&self) -> Result<usize, SearchError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(
        &self,
        record: DocumentRecord,
        summary_embedding: Option<Vec<f32>>,
        summary_text: Option<String>,
    ) -> Result<(), SearchError>;

    async fn get(&self, document_id: &str) -> Result<Option<StoredDocument>, SearchError>;

    // Merges `enrichment` into the current record in one step, keeping
    // edits made since ingestion. `None` when the document is gone.
    async fn enrich(
        &self,
        document_id: &str,
        enrichment: DocumentEnrichment,
    ) -> Result<Option<DocumentRecord>, SearchError>;

    async fn list_all(&self, limit: usize, offset: usize)
        -> Result<Vec<StoredDocument>, SearchError>;

    async fn search_by_filter(
        &self,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, SearchError>;

    async fn semantic_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentHit>, SearchError>;

    async fn delete(&self, document_id: &str) -> Result<bool, SearchError>;

    async fn statistics(&self) -> Result<StoreStatistics, SearchError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, params: GenerationParams)
        -> Result<String, SearchError>;
}
