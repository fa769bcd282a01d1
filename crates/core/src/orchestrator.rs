use crate::classifier::QueryClassifier;
use crate::error::bounded;
use crate::models::{
    snippet, ChunkRelevance, DocumentRecord, SearchRequest, SearchResponse, SearchResult,
    SearchType, SimilarDocuments, SortField, SortOrder,
};
use crate::store::{ChunkHit, DocumentHit, MetadataFilter};
use crate::traits::{ChunkIndex, DocumentStore, EmbeddingProvider};
use crate::SearchError;
use futures::{stream, StreamExt, TryStreamExt};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DOCUMENT_WEIGHT: f64 = 0.4;
const CHUNK_WEIGHT: f64 = 0.6;
const CHUNK_FIRST_MEAN_OF: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub call_timeout: Duration,
    pub max_concurrent_chunk_lookups: usize,
    pub chunk_evidence_limit: usize,
    pub chunk_lookup_top_k: usize,
    pub chunk_snippet_chars: usize,
    pub preview_chars: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            max_concurrent_chunk_lookups: 8,
            chunk_evidence_limit: 5,
            chunk_lookup_top_k: 20,
            chunk_snippet_chars: 300,
            preview_chars: 200,
        }
    }
}

pub struct SearchCoordinator<C: ?Sized, D: ?Sized, E: ?Sized> {
    chunks: Arc<C>,
    documents: Arc<D>,
    embedder: Arc<E>,
    classifier: QueryClassifier,
    options: EngineOptions,
}

impl<C, D, E> SearchCoordinator<C, D, E>
where
    C: ChunkIndex + ?Sized,
    D: DocumentStore + ?Sized,
    E: EmbeddingProvider + ?Sized,
{
    pub fn new(
        chunks: Arc<C>,
        documents: Arc<D>,
        embedder: Arc<E>,
        options: EngineOptions,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            chunks,
            documents,
            embedder,
            classifier: QueryClassifier::new()?,
            options,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        if request.top_k == 0 {
            return Err(SearchError::Validation("top_k must be at least 1".to_string()));
        }
        let started = Instant::now();

        let query = request.query_text();
        let search_type = match (query.is_some(), request.has_filters()) {
            (true, true) => SearchType::Hybrid,
            (true, false) => SearchType::Semantic,
            (false, _) => SearchType::Metadata,
        };
        let classification = query.map(|query| self.classifier.classify(query));
        info!(search_type = search_type.as_str(), top_k = request.top_k, "performing search");

        let mut results = match (search_type, query) {
            (SearchType::Semantic, Some(query)) => self.semantic_search(query, request).await?,
            (SearchType::Hybrid, Some(query)) => self.hybrid_search(query, request).await?,
            _ => self.metadata_search(request).await?,
        };

        sort_results(&mut results, request.sort_by, request.sort_order);
        results.truncate(request.top_k);

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            search_type = search_type.as_str(),
            results = results.len(),
            processing_time_ms,
            "search complete"
        );

        Ok(SearchResponse {
            search_type,
            total_results: results.len(),
            processing_time_ms,
            classification,
            results,
        })
    }

    pub async fn recommend(
        &self,
        query: &str,
        top_k: usize,
        file_types: &[String],
        exclude_ids: &[String],
    ) -> Result<Vec<SearchResult>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::Validation("recommendation query is empty".to_string()));
        }

        let embedding = self.embed_query(query).await?;
        let filter =
            MetadataFilter::any_of("file_type", file_types.iter().map(|kind| kind.to_lowercase()));
        let hits = bounded(
            "document store",
            self.options.call_timeout,
            self.documents.semantic_search(
                &embedding,
                top_k.saturating_add(exclude_ids.len()),
                filter.as_ref(),
            ),
        )
        .await?;

        Ok(hits
            .into_iter()
            .filter(|hit| !exclude_ids.contains(&hit.record.document_id))
            .take(top_k)
            .map(|hit| self.scored_result(hit))
            .collect())
    }

    pub async fn find_similar(
        &self,
        document_id: &str,
        limit: usize,
        exclude_ids: &[String],
    ) -> Result<SimilarDocuments, SearchError> {
        let source = bounded(
            "document store",
            self.options.call_timeout,
            self.documents.get(document_id),
        )
        .await?
        .ok_or_else(|| SearchError::NotFound(document_id.to_string()))?;

        let embedding = match source.summary_embedding.clone() {
            Some(embedding) => embedding,
            None => {
                let fallback = source
                    .record
                    .ai_summary
                    .clone()
                    .unwrap_or_else(|| source.record.filename.clone());
                self.embed_query(&fallback).await?
            }
        };

        let hits = bounded(
            "document store",
            self.options.call_timeout,
            self.documents.semantic_search(
                &embedding,
                limit.saturating_add(exclude_ids.len()).saturating_add(1),
                None,
            ),
        )
        .await?;

        let results = hits
            .into_iter()
            .filter(|hit| {
                hit.record.document_id != document_id
                    && !exclude_ids.contains(&hit.record.document_id)
            })
            .take(limit)
            .map(|hit| self.scored_result(hit))
            .collect();

        Ok(SimilarDocuments {
            source_document_id: source.record.document_id,
            source_filename: source.record.filename,
            results,
        })
    }

    // The document's leading chunks joined with spaces, for summary prompts.
    // The zero vector makes the query a pure `document_id` lookup.
    pub async fn document_preview(
        &self,
        document_id: &str,
        max_chunks: usize,
    ) -> Result<String, SearchError> {
        let probe = vec![0.0; self.embedder.dimensions()];
        let filter = MetadataFilter::eq("document_id", document_id);
        let mut hits = bounded(
            "chunk index",
            self.options.call_timeout,
            self.chunks
                .query(&probe, self.options.chunk_lookup_top_k, Some(&filter)),
        )
        .await?;
        hits.sort_by_key(|hit| hit.metadata.chunk_index);

        Ok(hits
            .into_iter()
            .take(max_chunks)
            .map(|hit| hit.text)
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SearchError> {
        bounded("embedding", self.options.call_timeout, self.embedder.embed(query)).await
    }

    async fn metadata_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, SearchError> {
        // Unbounded fetch: results are sorted before pagination.
        let stored = match store_filter(request) {
            Some(filter) => {
                bounded(
                    "document store",
                    self.options.call_timeout,
                    self.documents.search_by_filter(&filter, usize::MAX),
                )
                .await?
            }
            None => {
                bounded(
                    "document store",
                    self.options.call_timeout,
                    self.documents.list_all(usize::MAX, 0),
                )
                .await?
            }
        };

        Ok(stored
            .into_iter()
            .filter(|stored| passes_client_filters(&stored.record, request))
            .map(|stored| self.result_for(stored.record, stored.summary_text.as_deref()))
            .collect())
    }

    async fn semantic_search(
        &self,
        query: &str,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let embedding = self.embed_query(query).await?;

        if !request.use_doc_level_ranking {
            return self.chunk_first_search(&embedding, request).await;
        }

        let hits = bounded(
            "document store",
            self.options.call_timeout,
            self.documents
                .semantic_search(&embedding, request.top_k.saturating_mul(2), None),
        )
        .await?;
        self.rank_documents(hits, &embedding, request.include_chunk_scores)
            .await
    }

    async fn hybrid_search(
        &self,
        query: &str,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let embedding = self.embed_query(query).await?;
        let filter = store_filter(request);

        let hits = bounded(
            "document store",
            self.options.call_timeout,
            self.documents
                .semantic_search(&embedding, request.top_k.saturating_mul(3), filter.as_ref()),
        )
        .await?
        .into_iter()
        .filter(|hit| passes_client_filters(&hit.record, request))
        .collect();

        self.rank_documents(hits, &embedding, request.include_chunk_scores)
            .await
    }

    async fn rank_documents(
        &self,
        hits: Vec<DocumentHit>,
        embedding: &[f32],
        include_chunk_scores: bool,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if !include_chunk_scores {
            return Ok(hits.into_iter().map(|hit| self.scored_result(hit)).collect());
        }

        let evidence = stream::iter(hits.iter())
            .map(|hit| self.chunk_evidence(&hit.record.document_id, embedding))
            .buffered(self.options.max_concurrent_chunk_lookups.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        Ok(hits
            .into_iter()
            .zip(evidence)
            .map(|(hit, (best, chunks))| {
                let document_score = hit.similarity;
                let mut result = self.scored_result(hit);
                let chunk_score = best.unwrap_or(0.0);
                result.chunk_score = Some(chunk_score);
                result.aggregated_score =
                    Some(DOCUMENT_WEIGHT * document_score + CHUNK_WEIGHT * chunk_score);
                result.relevant_chunks = chunks;
                result
            })
            .collect())
    }

    async fn chunk_evidence(
        &self,
        document_id: &str,
        embedding: &[f32],
    ) -> Result<(Option<f64>, Vec<ChunkRelevance>), SearchError> {
        let filter = MetadataFilter::eq("document_id", document_id);
        let mut hits = bounded(
            "chunk index",
            self.options.call_timeout,
            self.chunks
                .query(embedding, self.options.chunk_lookup_top_k, Some(&filter)),
        )
        .await?;

        sort_hits_by_similarity(&mut hits);
        let best = hits.first().map(ChunkHit::similarity);
        let chunks = hits
            .iter()
            .take(self.options.chunk_evidence_limit)
            .map(|hit| self.relevance_for(hit))
            .collect();
        Ok((best, chunks))
    }

    async fn chunk_first_search(
        &self,
        embedding: &[f32],
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let hits = bounded(
            "chunk index",
            self.options.call_timeout,
            self.chunks.query(embedding, request.top_k.saturating_mul(10), None),
        )
        .await?;

        let mut order = Vec::<String>::new();
        let mut grouped = HashMap::<String, Vec<ChunkHit>>::new();
        for hit in hits {
            let document_id = hit.document_id().to_string();
            if !grouped.contains_key(&document_id) {
                order.push(document_id.clone());
            }
            grouped.entry(document_id).or_default().push(hit);
        }

        let records = stream::iter(order.iter())
            .map(|document_id| {
                bounded(
                    "document store",
                    self.options.call_timeout,
                    self.documents.get(document_id),
                )
            })
            .buffered(self.options.max_concurrent_chunk_lookups.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        let mut results = Vec::with_capacity(order.len());
        for (document_id, stored) in order.iter().zip(records) {
            let Some(stored) = stored else {
                debug!(document_id = %document_id, "chunk owner missing from document store");
                continue;
            };
            let Some(mut chunk_hits) = grouped.remove(document_id) else {
                continue;
            };
            sort_hits_by_similarity(&mut chunk_hits);

            let top = chunk_hits
                .iter()
                .take(CHUNK_FIRST_MEAN_OF)
                .map(ChunkHit::similarity)
                .collect::<Vec<_>>();
            let mean = top.iter().sum::<f64>() / top.len().max(1) as f64;

            let mut result = self.result_for(stored.record, stored.summary_text.as_deref());
            result.chunk_score = chunk_hits.first().map(ChunkHit::similarity);
            result.aggregated_score = Some(mean);
            if request.include_chunk_scores {
                result.relevant_chunks = chunk_hits
                    .iter()
                    .take(self.options.chunk_evidence_limit)
                    .map(|hit| self.relevance_for(hit))
                    .collect();
            }
            results.push(result);
        }

        Ok(results)
    }

    fn result_for(&self, document: DocumentRecord, summary: Option<&str>) -> SearchResult {
        let preview_snippet = summary
            .filter(|summary| !summary.is_empty())
            .map(|summary| snippet(summary, self.options.preview_chars));
        SearchResult {
            display_name: document.display_name().to_string(),
            document,
            preview_snippet,
            document_score: None,
            chunk_score: None,
            aggregated_score: None,
            relevant_chunks: Vec::new(),
        }
    }

    fn scored_result(&self, hit: DocumentHit) -> SearchResult {
        let mut result = self.result_for(hit.record, hit.summary_text.as_deref());
        result.document_score = Some(hit.similarity);
        result.aggregated_score = Some(hit.similarity);
        result
    }

    fn relevance_for(&self, hit: &ChunkHit) -> ChunkRelevance {
        ChunkRelevance {
            chunk_id: hit.chunk_id.clone(),
            text: snippet(&hit.text, self.options.chunk_snippet_chars),
            similarity_score: round4(hit.similarity()),
            chunk_index: Some(hit.metadata.chunk_index),
        }
    }
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn sort_hits_by_similarity(hits: &mut [ChunkHit]) {
    hits.sort_by(|left, right| {
        right
            .similarity()
            .total_cmp(&left.similarity())
            .then_with(|| left.chunk_id.cmp(&right.chunk_id))
    });
}

pub fn store_filter(request: &SearchRequest) -> Option<MetadataFilter> {
    let mut clauses = Vec::new();
    clauses.extend(MetadataFilter::any_of(
        "file_type",
        request.file_types.iter().map(|kind| kind.to_lowercase()),
    ));
    clauses.extend(MetadataFilter::any_of(
        "document_type",
        request.document_types.iter().map(|kind| kind.to_lowercase()),
    ));
    if let Some(min_pages) = request.min_pages {
        clauses.push(MetadataFilter::Gte {
            field: "page_count".to_string(),
            value: f64::from(min_pages),
        });
    }
    if let Some(max_pages) = request.max_pages {
        clauses.push(MetadataFilter::Lte {
            field: "page_count".to_string(),
            value: f64::from(max_pages),
        });
    }
    MetadataFilter::all(clauses)
}

pub fn passes_client_filters(record: &DocumentRecord, request: &SearchRequest) -> bool {
    if let Some(pattern) = request
        .filename_contains
        .as_deref()
        .filter(|pattern| !pattern.is_empty())
    {
        if !record
            .filename
            .to_lowercase()
            .contains(&pattern.to_lowercase())
        {
            return false;
        }
    }

    if !request.authors.is_empty() {
        let author = record.author.as_deref().unwrap_or_default().to_lowercase();
        if !request
            .authors
            .iter()
            .any(|candidate| candidate.to_lowercase() == author)
        {
            return false;
        }
    }

    if !request.keywords.is_empty() {
        let keywords = record.ai_keywords.join(", ").to_lowercase();
        if !request
            .keywords
            .iter()
            .any(|keyword| keywords.contains(&keyword.to_lowercase()))
        {
            return false;
        }
    }

    if !request.tags.is_empty() {
        let tags = record
            .tags
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
            .to_lowercase();
        if !request
            .tags
            .iter()
            .any(|tag| tags.contains(&tag.to_lowercase()))
        {
            return false;
        }
    }

    let size_mb = record.size_mb();
    let within = |lower: bool, bound: Option<f64>| {
        bound.map_or(true, |bound| if lower { size_mb >= bound } else { size_mb <= bound })
    };
    if !within(true, request.min_size_mb) || !within(false, request.max_size_mb) {
        return false;
    }

    let date_ok = |value, after: Option<_>, before: Option<_>| {
        after.map_or(true, |after| value >= after) && before.map_or(true, |before| value <= before)
    };
    date_ok(record.created_at, request.created_after, request.created_before)
        && date_ok(record.modified_at, request.modified_after, request.modified_before)
}

pub fn sort_results(results: &mut [SearchResult], sort_by: Option<SortField>, order: SortOrder) {
    let directed = |ordering: Ordering| match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    };

    results.sort_by(|left, right| {
        let primary = match sort_by {
            None | Some(SortField::Relevance) => right.relevance().total_cmp(&left.relevance()),
            Some(SortField::Filename) => directed(
                left.document
                    .filename
                    .to_lowercase()
                    .cmp(&right.document.filename.to_lowercase()),
            ),
            Some(SortField::CreatedAt) => {
                directed(left.document.created_at.cmp(&right.document.created_at))
            }
            Some(SortField::ModifiedAt) => {
                directed(left.document.modified_at.cmp(&right.document.modified_at))
            }
            Some(SortField::Size) => directed(left.document.size_bytes.cmp(&right.document.size_bytes)),
            Some(SortField::PageCount) => {
                directed(left.document.page_count.cmp(&right.document.page_count))
            }
        };
        primary.then_with(|| left.document_id().cmp(right.document_id()))
    });
}
