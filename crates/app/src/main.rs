use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use docscope_core::{
    AiMetadataGenerator, AiMetadataOptions, CharacterNgramEmbedder, ChunkIndex, ChunkingConfig,
    DocumentStore, EmbeddingProvider, EngineOptions, ExtractorRegistry, InMemoryChunkIndex,
    InMemoryDocumentStore, IngestOptions, IngestOutcome, IngestPipeline, LazyEmbedder,
    LlmProvider, OllamaEmbedder, OllamaLlm, QdrantChunkIndex, RagOptions, RagPipeline,
    SearchCoordinator, SearchRequest, SharedProvider, SortField, SortOrder, SummaryCache,
    SummaryGenerator, SummaryOptions, DEFAULT_EMBEDDING_DIMENSIONS,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OLLAMA_EMBEDDING_DIMENSIONS: usize = 768;
const PREVIEW_CHUNKS: usize = 3;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmbeddingBackend {
    /// Local hashed character trigrams.
    Ngram,
    Ollama,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChunkBackend {
    /// JSON snapshot under the data directory.
    Memory,
    Qdrant,
}

#[derive(Parser)]
#[command(name = "docscope", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory for the document store, chunk snapshot and summary cache
    #[arg(long, env = "DOCSCOPE_DATA_DIR", default_value = ".docscope")]
    data_dir: PathBuf,

    /// Ollama base URL
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    ollama_url: String,

    /// Model used for answers, summaries and metadata
    #[arg(long, env = "DOCSCOPE_LLM_MODEL", default_value = "llama3.2")]
    llm_model: String,

    #[arg(long, env = "DOCSCOPE_EMBEDDING_BACKEND", value_enum, default_value = "ngram")]
    embedding_backend: EmbeddingBackend,

    #[arg(long, env = "DOCSCOPE_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    embedding_model: String,

    /// Defaults to 128 for ngram and 768 for ollama
    #[arg(long, env = "DOCSCOPE_EMBEDDING_DIMENSIONS")]
    embedding_dimensions: Option<usize>,

    #[arg(long, env = "DOCSCOPE_CHUNK_BACKEND", value_enum, default_value = "memory")]
    chunk_backend: ChunkBackend,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "DOCSCOPE_QDRANT_COLLECTION", default_value = "document_chunks")]
    qdrant_collection: String,

    #[arg(long, env = "DOCSCOPE_CHUNK_SIZE", default_value = "400")]
    chunk_size: usize,

    #[arg(long, env = "DOCSCOPE_CHUNK_OVERLAP", default_value = "50")]
    chunk_overlap: usize,

    /// Upper bound on each store, embedding and LLM call
    #[arg(long, env = "DOCSCOPE_TIMEOUT_SECS", default_value = "120")]
    timeout_secs: u64,

    /// Chunk lookups in flight per search
    #[arg(long, env = "DOCSCOPE_CONCURRENCY", default_value = "8")]
    concurrency: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file, or every supported file below a folder.
    Ingest {
        path: PathBuf,
        /// Exit once content is stored, without waiting for AI metadata.
        #[arg(long, default_value_t = false)]
        skip_enrichment: bool,
    },
    /// Metadata, semantic or hybrid search, chosen from the arguments given.
    Search {
        query: Option<String>,
        #[arg(long, default_value = "10")]
        top_k: usize,
        #[arg(long)]
        filename: Option<String>,
        #[arg(long = "file-type")]
        file_types: Vec<String>,
        #[arg(long = "document-type")]
        document_types: Vec<String>,
        #[arg(long = "author")]
        authors: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        #[arg(long)]
        min_pages: Option<u32>,
        #[arg(long)]
        max_pages: Option<u32>,
        #[arg(long)]
        min_size_mb: Option<f64>,
        #[arg(long)]
        max_size_mb: Option<f64>,
        /// RFC 3339 timestamp
        #[arg(long)]
        created_after: Option<DateTime<Utc>>,
        #[arg(long)]
        created_before: Option<DateTime<Utc>>,
        #[arg(long)]
        modified_after: Option<DateTime<Utc>>,
        #[arg(long)]
        modified_before: Option<DateTime<Utc>>,
        /// relevance, filename, created_at, modified_at, size or page_count
        #[arg(long, value_parser = parse_sort_field)]
        sort_by: Option<SortField>,
        #[arg(long, value_parser = parse_sort_order, default_value = "desc")]
        sort_order: SortOrder,
        /// Rank by chunk evidence alone instead of document summaries.
        #[arg(long, default_value_t = false)]
        chunk_first: bool,
        /// Blend chunk evidence into document scores.
        #[arg(long, default_value_t = false)]
        chunk_scores: bool,
    },
    /// Documents related to a free-text interest.
    Recommend {
        query: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        #[arg(long = "file-type")]
        file_types: Vec<String>,
        #[arg(long = "exclude")]
        exclude_ids: Vec<String>,
    },
    /// Documents closest to an existing one.
    Similar {
        document_id: String,
        #[arg(long, default_value = "5")]
        limit: usize,
        #[arg(long = "exclude")]
        exclude_ids: Vec<String>,
    },
    /// Cached LLM summary of one document.
    Summary {
        document_id: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Answer a question from the collection.
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Remove a document, its chunks and its cached summary.
    Delete { document_id: String },
    /// Index, store and cache statistics.
    Stats,
    /// Stored documents in insertion order.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
}

fn parse_sort_field(raw: &str) -> Result<SortField, String> {
    serde_json::from_value(json!(raw)).map_err(|_| format!("unknown sort field: {raw}"))
}

fn parse_sort_order(raw: &str) -> Result<SortOrder, String> {
    serde_json::from_value(json!(raw.to_lowercase())).map_err(|_| format!("unknown sort order: {raw}"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Components {
    chunks: Arc<dyn ChunkIndex>,
    documents: Arc<dyn DocumentStore>,
    embedder: SharedProvider,
    llm: Arc<dyn LlmProvider>,
    cache: Arc<SummaryCache>,
    timeout: Duration,
}

impl Components {
    async fn build(cli: &Cli) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&cli.data_dir)
            .await
            .with_context(|| format!("creating {}", cli.data_dir.display()))?;

        let dimensions = cli.embedding_dimensions.unwrap_or(match cli.embedding_backend {
            EmbeddingBackend::Ngram => DEFAULT_EMBEDDING_DIMENSIONS,
            EmbeddingBackend::Ollama => OLLAMA_EMBEDDING_DIMENSIONS,
        });
        let embedder: SharedProvider = match cli.embedding_backend {
            EmbeddingBackend::Ngram => Arc::new(CharacterNgramEmbedder { dimensions }),
            EmbeddingBackend::Ollama => {
                let url = cli.ollama_url.clone();
                let model = cli.embedding_model.clone();
                Arc::new(LazyEmbedder::new(dimensions, move || {
                    let provider = OllamaEmbedder::new(&url, model.clone(), dimensions);
                    async move { Ok(Arc::new(provider?) as SharedProvider) }.boxed()
                }))
            }
        };

        let chunks: Arc<dyn ChunkIndex> = match cli.chunk_backend {
            ChunkBackend::Memory => {
                Arc::new(InMemoryChunkIndex::open(cli.data_dir.join("chunks.json")).await?)
            }
            ChunkBackend::Qdrant => {
                let index = QdrantChunkIndex::new(&cli.qdrant_url, &cli.qdrant_collection, dimensions)?;
                index.ensure_collection().await?;
                Arc::new(index)
            }
        };
        let documents: Arc<dyn DocumentStore> =
            Arc::new(InMemoryDocumentStore::open(cli.data_dir.join("documents.json")).await?);

        Ok(Self {
            chunks,
            documents,
            embedder,
            llm: Arc::new(OllamaLlm::new(&cli.ollama_url, &cli.llm_model)?),
            cache: Arc::new(SummaryCache::open(&cli.data_dir).await),
            timeout: Duration::from_secs(cli.timeout_secs),
        })
    }

    fn coordinator(
        &self,
        concurrency: usize,
    ) -> anyhow::Result<SearchCoordinator<dyn ChunkIndex, dyn DocumentStore, dyn EmbeddingProvider>> {
        let options = EngineOptions {
            call_timeout: self.timeout,
            max_concurrent_chunk_lookups: concurrency.max(1),
            ..EngineOptions::default()
        };
        Ok(SearchCoordinator::new(
            Arc::clone(&self.chunks),
            Arc::clone(&self.documents),
            Arc::clone(&self.embedder),
            options,
        )?)
    }

    fn ingest_pipeline(&self, chunking: ChunkingConfig) -> anyhow::Result<IngestPipeline> {
        let generator = AiMetadataGenerator::new(
            Arc::clone(&self.llm),
            AiMetadataOptions {
                timeout: self.timeout,
                ..AiMetadataOptions::default()
            },
        );
        Ok(IngestPipeline::new(
            Arc::clone(&self.chunks),
            Arc::clone(&self.documents),
            Arc::clone(&self.embedder),
            IngestOptions {
                chunking,
                call_timeout: self.timeout,
            },
        )?
        .with_ai_metadata(Arc::new(generator))
        .with_summary_cache(Arc::clone(&self.cache)))
    }
}

async fn ingest(
    pipeline: &IngestPipeline,
    path: &Path,
    skip_enrichment: bool,
) -> anyhow::Result<serde_json::Value> {
    let (outcomes, skipped) = if path.is_dir() {
        let report = pipeline.ingest_folder(path).await?;
        (report.ingested, report.skipped)
    } else {
        (vec![pipeline.ingest_file(path).await?], Vec::new())
    };

    for skip in &skipped {
        warn!(path = %skip.path.display(), reason = %skip.reason, "skipped file");
    }

    let mut documents = Vec::with_capacity(outcomes.len());
    for IngestOutcome { document, enrichment } in outcomes {
        let enriched = if skip_enrichment {
            None
        } else {
            match enrichment.wait().await {
                Ok(record) => Some(record.ai_document_type),
                Err(err) => {
                    warn!(document_id = %document.document_id, error = %err, "enrichment failed");
                    None
                }
            }
        };
        documents.push(json!({
            "document": document,
            "document_type": enriched.flatten(),
        }));
    }

    Ok(json!({
        "ingested": documents,
        "skipped": skipped,
        "finished_at": Utc::now().to_rfc3339(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let chunking = ChunkingConfig::new(cli.chunk_size, cli.chunk_overlap)?;
    let components = Components::build(&cli).await?;
    info!(
        version = app_version,
        data_dir = %cli.data_dir.display(),
        started_at = %Utc::now().to_rfc3339(),
        "docscope boot"
    );

    match cli.command {
        Command::Ingest {
            ref path,
            skip_enrichment,
        } => {
            let pipeline = components.ingest_pipeline(chunking)?;
            let report = ingest(&pipeline, path, skip_enrichment).await?;
            print_json(&report)?;
        }
        Command::Search {
            query,
            top_k,
            filename,
            file_types,
            document_types,
            authors,
            tags,
            keywords,
            min_pages,
            max_pages,
            min_size_mb,
            max_size_mb,
            created_after,
            created_before,
            modified_after,
            modified_before,
            sort_by,
            sort_order,
            chunk_first,
            chunk_scores,
        } => {
            let request = SearchRequest {
                query,
                top_k,
                filename_contains: filename,
                file_types,
                document_types,
                authors,
                tags,
                keywords,
                min_pages,
                max_pages,
                min_size_mb,
                max_size_mb,
                created_after,
                created_before,
                modified_after,
                modified_before,
                sort_by,
                sort_order,
                include_chunk_scores: chunk_scores,
                use_doc_level_ranking: !chunk_first,
            };
            let response = components.coordinator(cli.concurrency)?.search(&request).await?;
            print_json(&response)?;
        }
        Command::Recommend {
            query,
            top_k,
            file_types,
            exclude_ids,
        } => {
            let results = components
                .coordinator(cli.concurrency)?
                .recommend(&query, top_k, &file_types, &exclude_ids)
                .await?;
            print_json(&results)?;
        }
        Command::Similar {
            document_id,
            limit,
            exclude_ids,
        } => {
            let similar = components
                .coordinator(cli.concurrency)?
                .find_similar(&document_id, limit, &exclude_ids)
                .await?;
            print_json(&similar)?;
        }
        Command::Summary { document_id, force } => {
            let stored = components
                .documents
                .get(&document_id)
                .await?
                .with_context(|| format!("document not found: {document_id}"))?;
            let preview = match components
                .coordinator(cli.concurrency)?
                .document_preview(&document_id, PREVIEW_CHUNKS)
                .await
            {
                Ok(preview) if !preview.is_empty() => preview,
                Ok(_) => stored.record.ai_summary.clone().unwrap_or_default(),
                Err(err) => {
                    warn!(document_id = %document_id, error = %err, "chunk preview unavailable");
                    stored.record.ai_summary.clone().unwrap_or_default()
                }
            };

            let generator = SummaryGenerator::new(
                Arc::clone(&components.llm),
                Arc::clone(&components.cache),
                SummaryOptions {
                    timeout: components.timeout,
                    ..SummaryOptions::default()
                },
            );
            let summary = generator.generate(&stored.record, &preview, force).await;
            print_json(&summary)?;
        }
        Command::Ask { question, top_k } => {
            let pipeline = RagPipeline::new(
                Arc::clone(&components.chunks),
                Arc::clone(&components.embedder),
                Arc::clone(&components.llm),
                RagOptions {
                    call_timeout: components.timeout,
                    ..RagOptions::default()
                },
            )?;
            let answer = pipeline.ask(&question, top_k, None).await?;
            print_json(&answer)?;
        }
        Command::Delete { document_id } => {
            let report = components
                .ingest_pipeline(chunking)?
                .delete_document(&document_id)
                .await?;
            if !report.document_deleted {
                warn!(document_id = %document_id, "no stored document with this id");
            }
            print_json(&report)?;
        }
        Command::Stats => {
            let registry = ExtractorRegistry::default();
            let extensions = registry.extensions().collect::<Vec<_>>();
            let stats = json!({
                "chunks": components.chunks.count().await?,
                "documents": components.documents.statistics().await?,
                "summary_cache": components.cache.stats().await,
                "supported_extensions": extensions,
            });
            print_json(&stats)?;
        }
        Command::List { limit, offset } => {
            let documents = components.documents.list_all(limit, offset).await?;
            let records = documents
                .into_iter()
                .map(|stored| stored.record)
                .collect::<Vec<_>>();
            print_json(&records)?;
        }
    }

    Ok(())
}
