pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod extractor;
pub mod filter;
pub mod ingest;
pub mod intake;
pub mod models;
pub mod openai;
pub mod orchestrator;
pub mod prompt;
pub mod queue;
pub mod stores;
pub mod stream;
pub mod traits;

pub use chunking::{chunk_text, chunk_windows, normalize_whitespace, ChunkingConfig};
pub use embeddings::{CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{BackendError, IngestError, PublishError, QueryError, StoreError};
pub use events::{
    BroadcastPublisher, FanoutPublisher, ProgressEvent, ProgressKind, TracingPublisher,
};
pub use extractor::{extract_page_texts, LopdfExtractor, PageStream, PageText, PdfExtractor};
pub use filter::{build_filter, VectorFilter, VectorQuery};
pub use ingest::{IngestSummary, IngestionWorker, WorkerReport};
pub use intake::{
    discover_pdf_files, DocumentIntake, DocumentStatusView, UploadTags, UploadedFile,
};
pub use models::{
    Citation, ConversationThread, Document, DocumentStatus, IngestJob, IngestStage,
    IngestionOptions, Message, Progress, ReingestPolicy, RetrievalOptions, Role, Scope,
};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use orchestrator::{AnswerStreamer, AskRequest};
pub use queue::{MemoryJobQueue, RetryPolicy};
pub use stores::{LocalRecordStore, MemoryVectorIndex, QdrantStore};
pub use stream::{EventStream, StreamEvent};
pub use traits::{
    ConversationStore, DocumentStore, Embedder, Generator, JobDisposition, JobQueue,
    ProgressPublisher, VectorIndex,
};
