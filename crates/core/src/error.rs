use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("text extraction failed for {path}: {details}")]
    ExtractionFailed { path: String, details: String },

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("document produced no text: {0}")]
    EmptyDocument(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Search(#[from] SearchError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("mismatched lengths: chunks={chunks}, embeddings={embeddings}, metadatas={metadatas}")]
    DimensionMismatch {
        chunks: usize,
        embeddings: usize,
        metadatas: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{dependency} failed: {details}")]
    Dependency { dependency: String, details: String },

    #[error("{dependency} timed out after {after_ms}ms")]
    Timeout { dependency: String, after_ms: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl SearchError {
    pub fn dependency(dependency: impl Into<String>, details: impl ToString) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            details: details.to_string(),
        }
    }

    pub fn is_dependency(&self) -> bool {
        matches!(
            self,
            Self::Dependency { .. }
                | Self::Timeout { .. }
                | Self::Http(_)
                | Self::Url(_)
                | Self::Serialization(_)
        )
    }
}

pub async fn bounded<T, F>(
    dependency: &str,
    limit: std::time::Duration,
    call: F,
) -> std::result::Result<T, SearchError>
where
    F: std::future::Future<Output = std::result::Result<T, SearchError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SearchError::Timeout {
            dependency: dependency.to_string(),
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

pub(crate) fn endpoint_base(endpoint: &str) -> std::result::Result<url::Url, SearchError> {
    let base = url::Url::parse(&format!("{}/", endpoint.trim().trim_end_matches('/')))?;
    match base.scheme() {
        "http" | "https" => Ok(base),
        other => Err(SearchError::Validation(format!(
            "endpoint {endpoint} must use http or https, got {other}"
        ))),
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
