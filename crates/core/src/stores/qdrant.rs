use super::memory::chunk_point_id;
use crate::error::endpoint_base;
use crate::models::ChunkMetadata;
use crate::store::{ChunkHit, FieldValue, MetadataFilter};
use crate::traits::ChunkIndex;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "qdrant";

pub struct QdrantChunkIndex {
    endpoint: Url,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantChunkIndex {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, SearchError> {
        let collection = collection.into();
        if collection.is_empty() || collection.contains(['/', '?', '#']) {
            return Err(SearchError::Validation(format!(
                "invalid qdrant collection name {collection:?}"
            )));
        }
        Ok(Self {
            endpoint: endpoint_base(endpoint)?,
            collection,
            client: Client::new(),
            vector_size,
        })
    }

    fn collection_url(&self, suffix: &str) -> Result<Url, SearchError> {
        Ok(self
            .endpoint
            .join(&format!("collections/{}{}", self.collection, suffix))?)
    }

    pub async fn ensure_collection(&self) -> Result<(), SearchError> {
        let existing = self.client.get(self.collection_url("")?).send().await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(existing.status()));
        }

        let response = self
            .client
            .put(self.collection_url("")?)
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Euclid" }
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        info!(collection = %self.collection, vector_size = self.vector_size, "qdrant collection created");
        Ok(())
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), SearchError> {
        if vector.len() != self.vector_size {
            return Err(SearchError::Validation(format!(
                "embedding dimension {} != {}",
                vector.len(),
                self.vector_size
            )));
        }
        Ok(())
    }

    async fn count_matching(&self, filter: Option<Value>) -> Result<usize, SearchError> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let response = self
            .client
            .post(self.collection_url("/points/count")?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        let parsed: Value = response.json().await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::dependency(BACKEND, status)
}

// Qdrant point ids must be integers or UUIDs; chunk ids are hashed down to u64.
fn point_id(chunk_id: &str) -> u64 {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn field_value_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Number(number) => json!(number),
        FieldValue::Text(text) => json!(text),
    }
}

fn filter_json(filter: &MetadataFilter) -> Result<Value, SearchError> {
    match filter {
        MetadataFilter::Eq { field, value } => Ok(json!({
            "must": [{ "key": field, "match": { "value": field_value_json(value) } }]
        })),
        MetadataFilter::And(clauses) => Ok(json!({
            "must": clauses.iter().map(filter_json).collect::<Result<Vec<_>, _>>()?
        })),
        MetadataFilter::Or(clauses) => Ok(json!({
            "should": clauses.iter().map(filter_json).collect::<Result<Vec<_>, _>>()?
        })),
        MetadataFilter::Gte { .. } | MetadataFilter::Lte { .. } => Err(SearchError::Validation(
            format!("chunk index accepts exact-match filters only, got {filter:?}"),
        )),
    }
}

fn parse_hit(hit: &Value) -> Result<ChunkHit, SearchError> {
    let payload = hit
        .pointer("/payload")
        .ok_or_else(|| SearchError::dependency(BACKEND, "search hit without payload"))?;
    let chunk_id = payload
        .pointer("/chunk_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let text = payload
        .pointer("/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let metadata: ChunkMetadata = serde_json::from_value(payload.clone())?;
    let distance = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);

    Ok(ChunkHit {
        chunk_id,
        text,
        metadata,
        distance,
    })
}

#[async_trait]
impl ChunkIndex for QdrantChunkIndex {
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

        let points = texts
            .iter()
            .zip(embeddings)
            .zip(metadatas)
            .map(|((text, embedding), metadata)| {
                self.check_vector(embedding)?;
                let chunk_id = chunk_point_id(metadata);
                let mut payload = serde_json::to_value(metadata)?;
                payload["chunk_id"] = json!(chunk_id);
                payload["text"] = json!(text);
                Ok(json!({
                    "id": point_id(&chunk_id),
                    "vector": embedding,
                    "payload": payload,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        if points.is_empty() {
            return Ok(0);
        }

        let response = self
            .client
            .put(self.collection_url("/points?wait=true")?)
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        debug!(upserted = points.len(), collection = %self.collection, "chunks upserted");
        Ok(points.len())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ChunkHit>, SearchError> {
        self.check_vector(embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "vector": embedding,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter)?;
        }

        let response = self
            .client
            .post(self.collection_url("/points/search")?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(parse_hit).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, SearchError> {
        let filter = filter_json(&MetadataFilter::eq("document_id", document_id))?;
        let matching = self.count_matching(Some(filter.clone())).await?;
        if matching == 0 {
            return Ok(0);
        }

        let response = self
            .client
            .post(self.collection_url("/points/delete?wait=true")?)
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        info!(document_id, removed = matching, "chunks deleted");
        Ok(matching)
    }

    async fn count(&self) -> Result<usize, SearchError> {
        self.count_matching(None).await
    }
}
