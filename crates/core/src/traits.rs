use crate::error::{BackendError, IngestError, PublishError, StoreError};
use crate::events::ProgressEvent;
use crate::filter::{VectorFilter, VectorQuery};
use crate::models::{
    ConversationThread, Document, DocumentUpdate, IngestJob, Message, NewMessage, Scope,
    ScoredPoint, VectorPoint,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Incremental text produced by a [`Generator`]. Dropping it cancels the
/// upstream call.
pub type TokenStream = BoxStream<'static, Result<String, BackendError>>;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Returns one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<TokenStream, BackendError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upserts and waits until the points are durable.
    async fn upsert_points(&self, points: &[VectorPoint]) -> Result<(), BackendError>;

    async fn search_points(&self, query: &VectorQuery) -> Result<Vec<ScoredPoint>, BackendError>;

    async fn delete_points(&self, filter: &VectorFilter) -> Result<(), BackendError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn update_document(
        &self,
        id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, StoreError>;

    /// Newest first.
    async fn list_documents(&self) -> Result<Vec<Document>, StoreError>;

    async fn find_ready(&self, scope: &Scope) -> Result<Vec<Document>, StoreError>;

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, StoreError>;

    /// Most recently updated thread of `owner_id` with exactly this scope.
    async fn latest_thread(
        &self,
        owner_id: &str,
        scope: &Scope,
    ) -> Result<Option<ConversationThread>, StoreError>;

    async fn create_thread(
        &self,
        owner_id: &str,
        scope: &Scope,
    ) -> Result<ConversationThread, StoreError>;

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Retrying { attempt: u32, delay: Duration },
    DeadLettered,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, document_id: &str) -> Result<IngestJob, IngestError>;

    /// Claims the next available job, waiting at most `wait` for one.
    async fn claim(&self, wait: Duration) -> Result<Option<IngestJob>, IngestError>;

    async fn complete(&self, job: &IngestJob) -> Result<(), IngestError>;

    async fn fail(&self, job: &IngestJob, error: &IngestError)
        -> Result<JobDisposition, IngestError>;

    /// Pending plus in-flight jobs.
    async fn outstanding(&self) -> usize;
}

#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PublishError>;
}
