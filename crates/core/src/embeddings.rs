use crate::error::endpoint_base;
use crate::traits::EmbeddingProvider;
use crate::SearchError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub struct OllamaEmbedder {
    endpoint: Url,
    model: String,
    dimensions: usize,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: endpoint_base(endpoint)?,
            model: model.into(),
            dimensions,
            client: Client::new(),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        let response = self
            .client
            .post(self.endpoint.join("api/embed")?)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::dependency(
                "embedding",
                format!("ollama returned {status}: {body}"),
            ));
        }

        let parsed: EmbedResponse = response.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(SearchError::dependency(
                "embedding",
                format!(
                    "requested {} embeddings, received {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            ));
        }
        if let Some(vector) = parsed
            .embeddings
            .iter()
            .find(|vector| vector.len() != self.dimensions)
        {
            return Err(SearchError::Validation(format!(
                "model {} produced {} dimensions, configured {}",
                self.model,
                vector.len(),
                self.dimensions
            )));
        }

        debug!(model = %self.model, count = texts.len(), "embeddings generated");
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| SearchError::dependency("embedding", "empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

pub type SharedProvider = Arc<dyn EmbeddingProvider>;

type ProviderFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<SharedProvider, SearchError>> + Send + Sync>;

// An embedding model loaded on first use.
// Concurrent first callers wait on the same initialization; a failed
// load is not cached, so the next call retries it.
pub struct LazyEmbedder {
    dimensions: usize,
    provider: OnceCell<SharedProvider>,
    factory: ProviderFactory,
}

impl LazyEmbedder {
    pub fn new<F>(dimensions: usize, factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<SharedProvider, SearchError>> + Send + Sync + 'static,
    {
        Self {
            dimensions,
            provider: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    async fn provider(&self) -> Result<&SharedProvider, SearchError> {
        self.provider
            .get_or_try_init(|| async {
                let provider = (self.factory)().await?;
                if provider.dimensions() != self.dimensions {
                    return Err(SearchError::Validation(format!(
                        "embedding model has {} dimensions, configured {}",
                        provider.dimensions(),
                        self.dimensions
                    )));
                }
                info!(dimensions = self.dimensions, "embedding model initialized");
                Ok(provider)
            })
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.provider.initialized()
    }
}

#[async_trait]
impl EmbeddingProvider for LazyEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        self.provider().await?.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        self.provider().await?.embed_batch(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow").await.expect("embed");
        let second = embedder.embed("Hydraulic pressure and flow").await.expect("embed");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_text("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn similar_texts_are_closer() {
        let embedder = CharacterNgramEmbedder::default();
        let query = embedder.embed_text("quarterly revenue growth");
        let near = embedder.embed_text("revenue growth for the quarter");
        let far = embedder.embed_text("hiking boots and tents");
        let distance = |a: &[f32], b: &[f32]| crate::store::euclidean_distance(a, b);
        assert!(distance(&query, &near) < distance(&query, &far));
    }

    #[tokio::test]
    async fn lazy_embedder_initializes_once_under_contention() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let lazy = Arc::new(LazyEmbedder::new(16, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(Arc::new(CharacterNgramEmbedder { dimensions: 16 }) as SharedProvider)
            }
            .boxed()
        }));

        let calls = (0..8).map(|index| {
            let lazy = Arc::clone(&lazy);
            tokio::spawn(async move { lazy.embed(&format!("text {index}")).await })
        });
        for call in futures::future::join_all(calls).await {
            let vector = call.expect("task").expect("embed");
            assert_eq!(vector.len(), 16);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(lazy.is_initialized());
    }

    #[tokio::test]
    async fn lazy_embedder_rejects_dimension_drift() {
        let lazy = LazyEmbedder::new(8, || {
            async { Ok(Arc::new(CharacterNgramEmbedder { dimensions: 4 }) as SharedProvider) }.boxed()
        });
        let error = lazy.embed("text").await.expect_err("dimensions differ");
        assert!(matches!(error, SearchError::Validation(_)));
        assert!(!lazy.is_initialized());
    }
}
