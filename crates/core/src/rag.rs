use crate::classifier::QueryClassifier;
use crate::error::bounded;
use crate::models::{QueryClassification, RetrievedChunk};
use crate::orchestrator::round4;
use crate::store::MetadataFilter;
use crate::traits::{ChunkIndex, EmbeddingProvider, GenerationParams, LlmProvider};
use crate::SearchError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const NO_ANSWER: &str =
    "I don't have enough information to answer this question based on the provided documents.";

#[derive(Debug, Clone, Copy)]
pub struct RagOptions {
    pub top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub call_timeout: Duration,
}

impl Default for RagOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            temperature: 0.7,
            max_tokens: 1024,
            call_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub question: String,
    pub answer: String,
    pub chunks: Vec<RetrievedChunk>,
    pub classification: QueryClassification,
    pub processing_time_secs: f64,
}

pub struct RagPipeline<C: ?Sized, E: ?Sized, L: ?Sized> {
    chunks: Arc<C>,
    embedder: Arc<E>,
    llm: Arc<L>,
    classifier: QueryClassifier,
    options: RagOptions,
}

impl<C, E, L> RagPipeline<C, E, L>
where
    C: ChunkIndex + ?Sized,
    E: EmbeddingProvider + ?Sized,
    L: LlmProvider + ?Sized,
{
    pub fn new(
        chunks: Arc<C>,
        embedder: Arc<E>,
        llm: Arc<L>,
        options: RagOptions,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            chunks,
            embedder,
            llm,
            classifier: QueryClassifier::new()?,
            options,
        })
    }

    pub async fn retrieve(
        &self,
        question: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let timeout = self.options.call_timeout;
        let embedding = bounded("embedding", timeout, self.embedder.embed(question)).await?;
        let hits = bounded(
            "chunk index",
            timeout,
            self.chunks.query(&embedding, top_k, filter),
        )
        .await?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                similarity_score: round4(hit.similarity()),
                document_id: hit.document_id().to_string(),
                chunk_id: hit.chunk_id,
                text: hit.text,
                metadata: hit.metadata,
            })
            .collect())
    }

    pub async fn ask(
        &self,
        question: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Result<RagAnswer, SearchError> {
        let started = Instant::now();
        let question = question.trim();
        if question.is_empty() {
            return Err(SearchError::Validation("question must not be empty".to_string()));
        }
        let top_k = top_k.unwrap_or(self.options.top_k);
        if top_k == 0 {
            return Err(SearchError::Validation("top_k must be at least 1".to_string()));
        }

        // Advisory only: retrieval is the same for every query type.
        let classification = self.classifier.classify(question);

        let chunks = self.retrieve(question, top_k, filter).await?;
        let prompt = build_rag_prompt(&chunks, question);
        debug!(chunks = chunks.len(), prompt_chars = prompt.len(), "built rag prompt");

        let answer = bounded(
            "llm",
            self.options.call_timeout,
            self.llm.generate(
                &prompt,
                GenerationParams {
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                },
            ),
        )
        .await?;

        let processing_time_secs = started.elapsed().as_secs_f64();
        info!(
            llm = self.llm.name(),
            chunks = chunks.len(),
            elapsed_secs = processing_time_secs,
            "rag query completed"
        );
        Ok(RagAnswer {
            question: question.to_string(),
            answer,
            chunks,
            classification,
            processing_time_secs,
        })
    }
}

pub fn build_rag_prompt(chunks: &[RetrievedChunk], question: &str) -> String {
    if chunks.is_empty() {
        return format!(
            "Answer the following question to the best of your ability.\n\n\
             Question: {question}\n\n\
             Answer:"
        );
    }

    let context = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Context {}]:\n{}", i + 1, chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are a helpful assistant that answers questions based on the provided context.\n\n\
         Use the context below to answer the question. If the answer is not contained in the context, say \"{NO_ANSWER}\"\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ChunkMetadata, ChunkSource, QueryType};
    use crate::stores::InMemoryChunkIndex;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoLlm {
        prompts: Mutex<Vec<(String, f32)>>,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String, SearchError> {
            self.prompts
                .lock()
                .expect("prompts")
                .push((prompt.to_string(), params.temperature));
            Ok("Revenue grew 12%.".to_string())
        }
    }

    fn metadata(document_id: &str, index: usize) -> ChunkMetadata {
        ChunkMetadata {
            source: ChunkSource {
                document_id: document_id.to_string(),
                filename: format!("{document_id}.txt"),
                file_type: ".txt".to_string(),
                total_length: 100,
            },
            chunk_index: index,
            chunk_length: 40,
        }
    }

    async fn seeded_index(embedder: &CharacterNgramEmbedder) -> Arc<InMemoryChunkIndex> {
        let index = Arc::new(InMemoryChunkIndex::new());
        let texts = vec![
            "Revenue grew twelve percent in the third quarter.".to_string(),
            "The office moved to a new building downtown.".to_string(),
        ];
        let embeddings = texts.iter().map(|text| embedder.embed_text(text)).collect::<Vec<_>>();
        index
            .upsert(&texts, &embeddings, &[metadata("doc-a", 0), metadata("doc-b", 0)])
            .await
            .expect("upsert");
        index
    }

    #[tokio::test]
    async fn answers_cite_retrieved_context() {
        let embedder = CharacterNgramEmbedder::default();
        let index = seeded_index(&embedder).await;
        let llm = Arc::new(EchoLlm::default());
        let pipeline = RagPipeline::new(index, Arc::new(embedder), Arc::clone(&llm), RagOptions::default())
            .expect("pipeline");

        let answer = pipeline
            .ask("How much did revenue grow?", Some(1), None)
            .await
            .expect("answer");

        assert_eq!(answer.answer, "Revenue grew 12%.");
        assert_eq!(answer.chunks.len(), 1);
        assert_eq!(answer.chunks[0].document_id, "doc-a");
        assert_eq!(answer.classification.query_type, QueryType::Content);
        let score = answer.chunks[0].similarity_score;
        assert!(score > 0.0 && score <= 1.0);
        assert_eq!(score, round4(score));

        let prompts = llm.prompts.lock().expect("prompts");
        let (prompt, temperature) = &prompts[0];
        assert!(prompt.contains("[Context 1]:\nRevenue grew twelve percent"));
        assert!(!prompt.contains("[Context 2]"));
        assert!(prompt.ends_with("Question: How much did revenue grow?\n\nAnswer:"));
        assert_eq!(*temperature, 0.7);
    }

    #[test]
    fn empty_context_uses_the_plain_prompt() {
        let prompt = build_rag_prompt(&[], "What is Rust?");
        assert_eq!(
            prompt,
            "Answer the following question to the best of your ability.\n\nQuestion: What is Rust?\n\nAnswer:"
        );
    }

    #[test]
    fn context_prompt_carries_the_refusal_instruction() {
        let chunk = RetrievedChunk {
            chunk_id: "doc-a_chunk_0".to_string(),
            document_id: "doc-a".to_string(),
            text: "alpha".to_string(),
            similarity_score: 0.5,
            metadata: metadata("doc-a", 0),
        };
        let prompt = build_rag_prompt(&[chunk.clone(), chunk], "q");
        assert!(prompt.contains(NO_ANSWER));
        assert!(prompt.contains("[Context 1]:\nalpha\n\n[Context 2]:\nalpha"));
    }

    #[tokio::test]
    async fn blank_questions_are_rejected() {
        let embedder = CharacterNgramEmbedder::default();
        let pipeline = RagPipeline::new(
            Arc::new(InMemoryChunkIndex::new()),
            Arc::new(embedder),
            Arc::new(EchoLlm::default()),
            RagOptions::default(),
        )
        .expect("pipeline");
        assert!(matches!(
            pipeline.ask("   ", None, None).await,
            Err(SearchError::Validation(_))
        ));
    }
}
