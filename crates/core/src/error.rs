use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(String),

    #[error("vector dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("pdf extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embedding(#[source] BackendError),

    #[error("vector store failed: {0}")]
    VectorStore(#[source] BackendError),

    #[error("record store failed: {0}")]
    Store(#[from] StoreError),

    #[error("job queue failed: {0}")]
    Queue(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Whether a queue redelivery can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Embedding(_) | IngestError::VectorStore(_) | IngestError::Queue(_) => true,
            IngestError::Store(StoreError::NotFound { .. }) => false,
            IngestError::Store(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("embedding failed: {0}")]
    Embedding(#[source] BackendError),

    #[error("vector search failed: {0}")]
    VectorStore(#[source] BackendError),

    #[error("generation failed: {0}")]
    Generation(#[source] BackendError),

    #[error("record store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("event publish failed: {0}")]
pub struct PublishError(pub String);
