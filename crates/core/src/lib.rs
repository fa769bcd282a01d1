pub mod chunking;
pub mod classifier;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod rag;
pub mod store;
pub mod stores;
pub mod summary;
pub mod traits;

pub use chunking::{chunk_text, clean_text, split_into_sentences, ChunkingConfig};
pub use classifier::QueryClassifier;
pub use embeddings::{
    CharacterNgramEmbedder, LazyEmbedder, OllamaEmbedder, SharedProvider,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, SearchError};
pub use extractor::{ExtractedText, ExtractorRegistry, TextExtractor};
pub use ingest::{
    DeletionReport, EnrichmentHandle, FolderReport, IngestOptions, IngestOutcome, IngestPipeline,
    IngestedDocument, SkippedFile,
};
pub use llm::OllamaLlm;
pub use metadata::{extract_file_metadata, AiMetadata, AiMetadataGenerator, AiMetadataOptions};
pub use models::{
    Chunk, ChunkMetadata, ChunkRelevance, ChunkSource, DocumentRecord, QueryClassification, QueryType,
    RetrievedChunk, SearchRequest, SearchResponse, SearchResult, SearchType, SimilarDocuments,
    SmartSummary, SortField, SortOrder, StoreStatistics,
};
pub use orchestrator::{EngineOptions, SearchCoordinator};
pub use rag::{RagAnswer, RagOptions, RagPipeline};
pub use store::{
    ChunkHit, DocumentEnrichment, DocumentHit, FieldValue, MetadataFilter, StoredDocument,
};
pub use stores::{InMemoryChunkIndex, InMemoryDocumentStore, QdrantChunkIndex};
pub use summary::{CacheStats, SummaryCache, SummaryGenerator, SummaryOptions};
pub use traits::{ChunkIndex, DocumentStore, EmbeddingProvider, GenerationParams, LlmProvider};
