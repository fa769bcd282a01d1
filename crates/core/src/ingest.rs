use crate::chunking::{chunk_text, clean_text, ChunkingConfig};
use crate::error::bounded;
use crate::extractor::ExtractorRegistry;
use crate::metadata::{extract_file_metadata, AiMetadataGenerator};
use crate::models::{ChunkSource, DocumentRecord};
use crate::store::DocumentEnrichment;
use crate::summary::SummaryCache;
use crate::traits::{ChunkIndex, DocumentStore, EmbeddingProvider, LlmProvider};
use crate::{IngestError, SearchError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SUMMARY_EMBEDDING_SOURCE_CHARS: usize = 3000;

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub chunking: ChunkingConfig,
    pub call_timeout: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            call_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestedDocument {
    pub document_id: String,
    pub filename: String,
    pub chunk_count: usize,
    pub text_length: usize,
    pub page_count: Option<u32>,
}

pub struct EnrichmentHandle {
    pub document_id: String,
    task: JoinHandle<Result<DocumentRecord, IngestError>>,
}

impl EnrichmentHandle {
    pub async fn wait(self) -> Result<DocumentRecord, IngestError> {
        self.task
            .await
            .map_err(|err| IngestError::Task(err.to_string()))?
    }
}

pub struct IngestOutcome {
    pub document: IngestedDocument,
    pub enrichment: EnrichmentHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct FolderReport {
    pub ingested: Vec<IngestOutcome>,
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeletionReport {
    pub chunks_deleted: usize,
    pub document_deleted: bool,
    pub summary_invalidated: bool,
}

pub struct IngestPipeline {
    extractors: ExtractorRegistry,
    chunks: Arc<dyn ChunkIndex>,
    documents: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    metadata: Option<Arc<AiMetadataGenerator<dyn LlmProvider>>>,
    summaries: Option<Arc<SummaryCache>>,
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(
        chunks: Arc<dyn ChunkIndex>,
        documents: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: IngestOptions,
    ) -> Result<Self, IngestError> {
        options.chunking.validate()?;
        Ok(Self {
            extractors: ExtractorRegistry::default(),
            chunks,
            documents,
            embedder,
            metadata: None,
            summaries: None,
            options,
        })
    }

    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_ai_metadata(mut self, generator: Arc<AiMetadataGenerator<dyn LlmProvider>>) -> Self {
        self.metadata = Some(generator);
        self
    }

    pub fn with_summary_cache(mut self, cache: Arc<SummaryCache>) -> Self {
        self.summaries = Some(cache);
        self
    }

    pub fn extractors(&self) -> &ExtractorRegistry {
        &self.extractors
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let document_id = uuid::Uuid::new_v4().to_string();
        let extractors = self.extractors.clone();
        let owned_path = path.to_path_buf();

        let (record, extracted) = tokio::task::spawn_blocking(move || {
            let extracted = extractors.extract(&owned_path)?;
            let record = extract_file_metadata(&owned_path, document_id)?;
            Ok::<_, IngestError>((record, extracted))
        })
        .await
        .map_err(|err| IngestError::Task(err.to_string()))??;

        let mut record = record;
        if record.page_count.is_none() {
            record.page_count = extracted.page_count;
        }
        self.ingest_text(record, &extracted.text).await
    }

    // Stores chunks first, then the record. Either failure aborts the
    // ingestion; a record that fails to store takes its chunks with it.
    pub async fn ingest_text(
        &self,
        record: DocumentRecord,
        text: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let text = clean_text(text);
        if text.is_empty() {
            return Err(IngestError::EmptyDocument(record.filename.clone()));
        }

        let source = ChunkSource {
            document_id: record.document_id.clone(),
            filename: record.filename.clone(),
            file_type: record.file_type.clone(),
            total_length: text.chars().count(),
        };
        let (texts, metadatas): (Vec<String>, Vec<_>) =
            chunk_text(&text, &source, self.options.chunking)
                .into_iter()
                .unzip();

        let timeout = self.options.call_timeout;
        let embeddings = bounded("embedding", timeout, self.embedder.embed_batch(&texts)).await?;
        let stored = bounded(
            "chunk index",
            timeout,
            self.chunks.upsert(&texts, &embeddings, &metadatas),
        )
        .await?;

        let put = bounded(
            "document store",
            timeout,
            self.documents.put(record.clone(), None, None),
        )
        .await;
        if let Err(err) = put {
            if let Err(cleanup) = self.chunks.delete_by_document(&record.document_id).await {
                warn!(document_id = %record.document_id, error = %cleanup, "orphaned chunks left after failed put");
            }
            return Err(err.into());
        }

        info!(
            document_id = %record.document_id,
            filename = %record.filename,
            chunk_count = stored,
            "document ingested"
        );

        let document = IngestedDocument {
            document_id: record.document_id.clone(),
            filename: record.filename.clone(),
            chunk_count: stored,
            text_length: source.total_length,
            page_count: record.page_count,
        };
        let enrichment = self.spawn_enrichment(record, text);
        Ok(IngestOutcome {
            document,
            enrichment,
        })
    }

    fn spawn_enrichment(&self, record: DocumentRecord, text: String) -> EnrichmentHandle {
        let document_id = record.document_id.clone();
        let documents = Arc::clone(&self.documents);
        let embedder = Arc::clone(&self.embedder);
        let metadata = self.metadata.clone();
        let timeout = self.options.call_timeout;

        let task = tokio::spawn(async move {
            let result = enrich(record, text, documents, embedder, metadata, timeout).await;
            if let Err(err) = &result {
                warn!(error = %err, "metadata enrichment failed");
            }
            result
        });
        EnrichmentHandle { document_id, task }
    }

    pub async fn ingest_folder(&self, folder: &Path) -> Result<FolderReport, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(folder)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort_unstable();

        let mut report = FolderReport {
            ingested: Vec::new(),
            skipped: Vec::new(),
        };
        for path in files {
            if !self.extractors.supports(&path) {
                debug!(path = %path.display(), "skipping unsupported file");
                report.skipped.push(SkippedFile {
                    reason: IngestError::UnsupportedFormat(crate::models::extension_of(
                        &path.to_string_lossy(),
                    ))
                    .to_string(),
                    path,
                });
                continue;
            }
            match self.ingest_file(&path).await {
                Ok(outcome) => report.ingested.push(outcome),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping file");
                    report.skipped.push(SkippedFile {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if report.ingested.is_empty() && report.skipped.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no files found in {}",
                folder.display()
            )));
        }
        Ok(report)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<DeletionReport, SearchError> {
        let timeout = self.options.call_timeout;
        let chunks_deleted =
            bounded("chunk index", timeout, self.chunks.delete_by_document(document_id)).await?;
        let document_deleted =
            bounded("document store", timeout, self.documents.delete(document_id)).await?;
        let summary_invalidated = match &self.summaries {
            Some(cache) => cache.invalidate(document_id).await?,
            None => false,
        };

        info!(document_id, chunks_deleted, document_deleted, "document deleted");
        Ok(DeletionReport {
            chunks_deleted,
            document_deleted,
            summary_invalidated,
        })
    }
}

async fn enrich(
    record: DocumentRecord,
    text: String,
    documents: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    metadata: Option<Arc<AiMetadataGenerator<dyn LlmProvider>>>,
    timeout: Duration,
) -> Result<DocumentRecord, IngestError> {
    let mut enrichment = DocumentEnrichment::default();
    if let Some(generator) = metadata {
        let generated = generator.generate_all(&text, &record.filename).await;
        if generated.summary_generated {
            enrichment.summary_text = Some(generated.summary.clone());
        }
        enrichment.ai_summary = Some(generated.summary);
        enrichment.ai_keywords = Some(generated.keywords);
        enrichment.ai_document_type = Some(generated.document_type);
    }

    // Without a usable summary the opening text stands in for it.
    let embedding_source = match &enrichment.summary_text {
        Some(summary) => summary.clone(),
        None => text.chars().take(SUMMARY_EMBEDDING_SOURCE_CHARS).collect(),
    };
    enrichment.summary_embedding =
        Some(bounded("embedding", timeout, embedder.embed(&embedding_source)).await?);

    let document_id = record.document_id;
    let record = bounded(
        "document store",
        timeout,
        documents.enrich(&document_id, enrichment),
    )
    .await?
    .ok_or_else(|| SearchError::NotFound(format!("document {document_id} removed before enrichment")))?;

    info!(
        document_id = %document_id,
        document_type = record.ai_document_type.as_deref().unwrap_or("unknown"),
        keywords = record.ai_keywords.len(),
        "document enriched"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::metadata::{AiMetadataOptions, SUMMARY_FAILED};
    use crate::store::{ChunkHit, MetadataFilter};
    use crate::stores::{InMemoryChunkIndex, InMemoryDocumentStore};
    use crate::traits::GenerationParams;
    use async_trait::async_trait;

    struct CannedLlm {
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, prompt: &str, _params: GenerationParams) -> Result<String, SearchError> {
            if self.fail {
                return Err(SearchError::dependency("llm", "offline"));
            }
            Ok(if prompt.starts_with("Analyze") {
                "Quarterly revenue report.".to_string()
            } else if prompt.starts_with("Extract") {
                "Revenue, Growth".to_string()
            } else {
                "report".to_string()
            })
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl ChunkIndex for BrokenIndex {
        async fn upsert(&self, _: &[String], _: &[Vec<f32>], _: &[crate::models::ChunkMetadata]) -> Result<usize, SearchError> {
            Err(SearchError::dependency("chunk index", "disk full"))
        }

        async fn query(&self, _: &[f32], _: usize, _: Option<&MetadataFilter>) -> Result<Vec<ChunkHit>, SearchError> {
            Ok(Vec::new())
        }

        async fn delete_by_document(&self, _: &str) -> Result<usize, SearchError> {
            Ok(0)
        }

        async fn count(&self) -> Result<usize, SearchError> {
            Ok(0)
        }
    }

    struct Fixture {
        pipeline: IngestPipeline,
        chunks: Arc<InMemoryChunkIndex>,
        documents: Arc<InMemoryDocumentStore>,
    }

    fn fixture(llm_fails: bool) -> Fixture {
        let chunks = Arc::new(InMemoryChunkIndex::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let llm: Arc<dyn LlmProvider> = Arc::new(CannedLlm { fail: llm_fails });
        let pipeline = IngestPipeline::new(
            chunks.clone(),
            documents.clone(),
            Arc::new(CharacterNgramEmbedder::default()),
            IngestOptions {
                chunking: ChunkingConfig::new(60, 10).expect("config"),
                ..IngestOptions::default()
            },
        )
        .expect("pipeline")
        .with_ai_metadata(Arc::new(AiMetadataGenerator::new(llm, AiMetadataOptions::default())));
        Fixture {
            pipeline,
            chunks,
            documents,
        }
    }

    const REPORT: &str = "Revenue grew in the third quarter. Costs stayed flat. \
        The board approved the new budget. Hiring resumes next year.";

    #[tokio::test]
    async fn ingestion_stores_chunks_then_enriches_the_record() {
        let fx = fixture(false);
        let outcome = fx
            .pipeline
            .ingest_text(DocumentRecord::new("doc-1", "q3.txt"), REPORT)
            .await
            .expect("ingest");

        assert!(outcome.document.chunk_count > 1);
        assert_eq!(fx.chunks.count().await.expect("count"), outcome.document.chunk_count);

        let enriched = outcome.enrichment.wait().await.expect("enrichment");
        assert_eq!(enriched.ai_summary.as_deref(), Some("Quarterly revenue report."));
        assert_eq!(enriched.ai_keywords, vec!["revenue", "growth"]);
        assert_eq!(enriched.ai_document_type.as_deref(), Some("report"));

        let stored = fx.documents.get("doc-1").await.expect("get").expect("stored");
        assert!(stored.summary_embedding.is_some());
        assert_eq!(stored.summary_text.as_deref(), Some("Quarterly revenue report."));
    }

    #[tokio::test]
    async fn enrichment_failures_degrade_to_defaults() {
        let fx = fixture(true);
        let outcome = fx
            .pipeline
            .ingest_text(DocumentRecord::new("doc-1", "q3.txt"), REPORT)
            .await
            .expect("ingest");
        let enriched = outcome.enrichment.wait().await.expect("enrichment");

        assert_eq!(enriched.ai_summary.as_deref(), Some(SUMMARY_FAILED));
        assert!(enriched.ai_keywords.is_empty());
        assert_eq!(enriched.ai_document_type.as_deref(), Some("other"));
        let stored = fx.documents.get("doc-1").await.expect("get").expect("stored");
        assert!(stored.summary_embedding.is_some());
        assert!(stored.summary_text.is_none());
    }

    #[tokio::test]
    async fn chunk_index_failure_aborts_before_the_record_is_stored() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let pipeline = IngestPipeline::new(
            Arc::new(BrokenIndex),
            documents.clone(),
            Arc::new(CharacterNgramEmbedder::default()),
            IngestOptions::default(),
        )
        .expect("pipeline");

        let error = pipeline
            .ingest_text(DocumentRecord::new("doc-1", "a.txt"), REPORT)
            .await
            .err()
            .expect("ingest should fail");
        assert!(matches!(error, IngestError::Search(ref inner) if inner.is_dependency()));
        assert!(documents.get("doc-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let fx = fixture(false);
        let error = fx
            .pipeline
            .ingest_text(DocumentRecord::new("doc-1", "a.txt"), " \n\u{0}\n ")
            .await
            .err()
            .expect("empty");
        assert!(matches!(error, IngestError::EmptyDocument(_)));
    }

    #[tokio::test]
    async fn folder_ingestion_reports_skipped_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("a.txt"), REPORT).expect("write");
        std::fs::write(dir.path().join("nested/b.md"), "Notes about hiring plans.").expect("write");
        std::fs::write(dir.path().join("c.rar"), b"binary").expect("write");
        std::fs::write(dir.path().join("d.txt"), "   ").expect("write");

        let fx = fixture(false);
        let report = fx.pipeline.ingest_folder(dir.path()).await.expect("folder");

        let mut names: Vec<_> = report
            .ingested
            .iter()
            .map(|outcome| outcome.document.filename.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.md"]);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().any(|skip| skip.reason.contains(".rar")));
        for outcome in report.ingested {
            outcome.enrichment.wait().await.expect("enrichment");
        }
        assert_eq!(fx.documents.statistics().await.expect("stats").total_documents, 2);
    }

    #[tokio::test]
    async fn deletion_cascades_to_chunks_and_summaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(SummaryCache::open(dir.path()).await);
        cache
            .set("doc-1", "cached".to_string(), Vec::new(), Default::default())
            .await
            .expect("cache set");

        let fx = fixture(false);
        let pipeline = fx.pipeline.with_summary_cache(Arc::clone(&cache));
        let outcome = pipeline
            .ingest_text(DocumentRecord::new("doc-1", "q3.txt"), REPORT)
            .await
            .expect("ingest");
        outcome.enrichment.wait().await.expect("enrichment");

        let report = pipeline.delete_document("doc-1").await.expect("delete");
        assert_eq!(report.chunks_deleted, outcome.document.chunk_count);
        assert!(report.document_deleted);
        assert!(report.summary_invalidated);
        assert_eq!(fx.chunks.count().await.expect("count"), 0);
        assert!(fx.documents.get("doc-1").await.expect("get").is_none());
        assert!(cache.get("doc-1").await.is_none());
    }

    struct GatedLlm {
        gate: tokio::sync::Semaphore,
        inner: CannedLlm,
    }

    #[async_trait]
    impl LlmProvider for GatedLlm {
        fn name(&self) -> &str {
            "gated"
        }

        async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String, SearchError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| SearchError::dependency("llm", "gate closed"))?;
            self.inner.generate(prompt, params).await
        }
    }

    fn gated_fixture() -> (Fixture, Arc<GatedLlm>) {
        let llm = Arc::new(GatedLlm {
            gate: tokio::sync::Semaphore::new(0),
            inner: CannedLlm { fail: false },
        });
        let shared: Arc<dyn LlmProvider> = llm.clone();
        let mut fx = fixture(false);
        fx.pipeline = fx
            .pipeline
            .with_ai_metadata(Arc::new(AiMetadataGenerator::new(shared, AiMetadataOptions::default())));
        (fx, llm)
    }

    #[tokio::test]
    async fn enrichment_keeps_edits_made_while_it_ran() {
        let (fx, llm) = gated_fixture();
        let outcome = fx
            .pipeline
            .ingest_text(DocumentRecord::new("doc-1", "q3.txt"), REPORT)
            .await
            .expect("ingest");

        let mut edited = fx.documents.get("doc-1").await.expect("get").expect("stored").record;
        edited.tags.insert("finance".to_string());
        fx.documents.put(edited, None, None).await.expect("tag edit");
        llm.gate.add_permits(16);

        let enriched = outcome.enrichment.wait().await.expect("enrichment");
        assert!(enriched.tags.contains("finance"));
        assert_eq!(enriched.ai_document_type.as_deref(), Some("report"));
        let stored = fx.documents.get("doc-1").await.expect("get").expect("stored");
        assert!(stored.record.tags.contains("finance"));
        assert!(stored.summary_embedding.is_some());
    }

    #[tokio::test]
    async fn documents_deleted_during_enrichment_stay_deleted() {
        let (fx, llm) = gated_fixture();
        let outcome = fx
            .pipeline
            .ingest_text(DocumentRecord::new("doc-1", "q3.txt"), REPORT)
            .await
            .expect("ingest");

        fx.pipeline.delete_document("doc-1").await.expect("delete");
        llm.gate.add_permits(16);

        let result = outcome.enrichment.wait().await;
        assert!(matches!(result, Err(IngestError::Search(SearchError::NotFound(_)))));
        assert!(fx.documents.get("doc-1").await.expect("get").is_none());
        assert_eq!(fx.chunks.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn missing_folders_are_invalid() {
        let fx = fixture(false);
        let error = fx
            .pipeline
            .ingest_folder(Path::new("/definitely/not/here"))
            .await
            .err()
            .expect("missing folder");
        assert!(matches!(error, IngestError::InvalidArgument(_)));
    }
}
