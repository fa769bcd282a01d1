use async_trait::async_trait;
use docscope_core::{
    AiMetadataGenerator, AiMetadataOptions, CharacterNgramEmbedder, ChunkIndex, ChunkingConfig,
    DocumentStore, EngineOptions, GenerationParams, InMemoryChunkIndex, InMemoryDocumentStore,
    IngestOptions, IngestPipeline, LlmProvider, SearchCoordinator, SearchError, SearchRequest,
    SearchType, SummaryCache, SummaryGenerator, SummaryOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct OfflineLlm {
    smart_summaries: AtomicUsize,
}

#[async_trait]
impl LlmProvider for OfflineLlm {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(&self, prompt: &str, _params: GenerationParams) -> Result<String, SearchError> {
        let reply = if prompt.starts_with("Analyze") {
            if prompt.contains("invoice") {
                "An invoice for consulting services."
            } else {
                "Notes on hiking trails and camping gear."
            }
        } else if prompt.starts_with("Extract") {
            "consulting, billing"
        } else if prompt.starts_with("Classify") {
            if prompt.contains("Filename: invoice.txt") {
                "invoice"
            } else {
                "notes"
            }
        } else {
            self.smart_summaries.fetch_add(1, Ordering::SeqCst);
            "SUMMARY: Consulting invoice for March.\nKEY_TOPICS: billing, consulting"
        };
        Ok(reply.to_string())
    }
}

const INVOICE: &str = "This invoice covers consulting services delivered in March. \
    Payment is due within thirty days. Late payments accrue interest. \
    Contact the billing department with any questions about this invoice.";

const TRAILS: &str = "The northern trail climbs through pine forest to the ridge. \
    Bring a tent, a stove and warm layers. Water is available at the lake.";

#[tokio::test]
async fn ingest_search_summarize_delete() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let docs = workspace.path().join("docs");
    std::fs::create_dir(&docs).expect("mkdir");
    std::fs::write(docs.join("invoice.txt"), INVOICE).expect("write");
    std::fs::write(docs.join("trails.md"), TRAILS).expect("write");

    let chunks = Arc::new(
        InMemoryChunkIndex::open(workspace.path().join("chunks.json"))
            .await
            .expect("chunk index"),
    );
    let documents = Arc::new(
        InMemoryDocumentStore::open(workspace.path().join("documents.json"))
            .await
            .expect("document store"),
    );
    let embedder = Arc::new(CharacterNgramEmbedder::default());
    let llm = Arc::new(OfflineLlm::default());
    let cache = Arc::new(SummaryCache::open(workspace.path()).await);

    let shared_llm: Arc<dyn LlmProvider> = llm.clone();
    let pipeline = IngestPipeline::new(
        chunks.clone(),
        documents.clone(),
        embedder.clone(),
        IngestOptions {
            chunking: ChunkingConfig::new(80, 20).expect("chunking"),
            ..IngestOptions::default()
        },
    )
    .expect("pipeline")
    .with_ai_metadata(Arc::new(AiMetadataGenerator::new(
        Arc::clone(&shared_llm),
        AiMetadataOptions::default(),
    )))
    .with_summary_cache(Arc::clone(&cache));

    let report = pipeline.ingest_folder(&docs).await.expect("ingest folder");
    assert!(report.skipped.is_empty());
    let mut invoice_id = None;
    for outcome in report.ingested {
        let record = outcome.enrichment.wait().await.expect("enrichment");
        if record.filename == "invoice.txt" {
            assert_eq!(record.ai_document_type.as_deref(), Some("invoice"));
            invoice_id = Some(record.document_id);
        }
    }
    let invoice_id = invoice_id.expect("invoice ingested");

    let engine = SearchCoordinator::new(
        chunks.clone(),
        documents.clone(),
        embedder.clone(),
        EngineOptions::default(),
    )
    .expect("engine");

    let mut request = SearchRequest::with_query("consulting invoice payment");
    request.include_chunk_scores = true;
    let response = engine.search(&request).await.expect("semantic search");
    assert_eq!(response.search_type, SearchType::Semantic);
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].document_id(), invoice_id);
    assert!(!response.results[0].relevant_chunks.is_empty());

    let mut listing = SearchRequest::default();
    listing.file_types = vec![".md".to_string()];
    let response = engine.search(&listing).await.expect("metadata search");
    assert_eq!(response.search_type, SearchType::Metadata);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document.filename, "trails.md");

    let stored = documents
        .get(&invoice_id)
        .await
        .expect("get")
        .expect("invoice stored");
    let preview = engine
        .document_preview(&invoice_id, 3)
        .await
        .expect("preview");
    assert!(preview.starts_with("This invoice covers consulting services"));

    let summaries = SummaryGenerator::new(shared_llm, Arc::clone(&cache), SummaryOptions::default());
    let first = summaries.generate(&stored.record, &preview, false).await;
    let second = summaries.generate(&stored.record, &preview, false).await;
    assert_eq!(first.summary, "Consulting invoice for March.");
    assert_eq!(first.key_topics, vec!["billing", "consulting"]);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(llm.smart_summaries.load(Ordering::SeqCst), 1);

    let deletion = pipeline.delete_document(&invoice_id).await.expect("delete");
    assert!(deletion.document_deleted);
    assert!(deletion.summary_invalidated);
    assert!(deletion.chunks_deleted > 0);
    assert!(documents.get(&invoice_id).await.expect("get").is_none());
    assert!(cache.get(&invoice_id).await.is_none());

    let response = engine
        .search(&SearchRequest::with_query("consulting invoice payment"))
        .await
        .expect("search after delete");
    assert!(response
        .results
        .iter()
        .all(|result| result.document_id() != invoice_id));

    // Snapshots reload into fresh stores.
    let reopened = InMemoryChunkIndex::open(workspace.path().join("chunks.json"))
        .await
        .expect("reopen");
    assert_eq!(
        reopened.count().await.expect("count"),
        chunks.count().await.expect("count")
    );
}
