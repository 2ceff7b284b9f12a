use crate::error::IngestError;
use crate::filter::VectorFilter;
use crate::models::{Document, DocumentStatus, Progress, DEFAULT_CATEGORY};
use crate::traits::{DocumentStore, JobQueue, VectorIndex};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

pub const PDF_MIME: &str = "application/pdf";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 250 * 1024 * 1024;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if has_pdf_extension(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// A file accepted for ingestion, before it gets a document identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub source: PathBuf,
    pub filename: String,
    pub mime: String,
    pub size_bytes: u64,
}

impl UploadedFile {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
            })?;

        let mime = if has_pdf_extension(path) {
            PDF_MIME
        } else {
            "application/octet-stream"
        };

        Ok(Self {
            source: path.to_path_buf(),
            filename: filename.to_string(),
            mime: mime.to_string(),
            size_bytes: metadata.len(),
        })
    }
}

/// Ownership and classification attached at upload time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadTags {
    pub owner_id: String,
    pub category: Option<String>,
    pub state: Option<String>,
    pub district: Option<String>,
}

fn tag(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl UploadTags {
    fn category(&self) -> String {
        tag(self.category.as_deref())
            .map(|category| category.to_lowercase())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatusView {
    pub id: String,
    pub status: DocumentStatus,
    pub progress: Progress,
    pub error_message: String,
}

impl From<&Document> for DocumentStatusView {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            status: document.status,
            progress: document.progress,
            error_message: document.error_message.clone(),
        }
    }
}

/// Document management around the ingestion pipeline: accepting uploads,
/// re-queueing after crashes, and deleting across both stores.
#[derive(Clone)]
pub struct DocumentIntake {
    records: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    queue: Arc<dyn JobQueue>,
    upload_dir: PathBuf,
    max_upload_bytes: u64,
}

impl DocumentIntake {
    pub fn new(
        records: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        queue: Arc<dyn JobQueue>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            records,
            vectors,
            queue,
            upload_dir: upload_dir.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    /// Stores the file under its new identifier, records it as `queued`
    /// and enqueues its ingestion job.
    pub async fn register_upload(
        &self,
        file: UploadedFile,
        tags: UploadTags,
    ) -> Result<Document, IngestError> {
        if file.mime != PDF_MIME {
            return Err(IngestError::InvalidArgument(format!(
                "only PDF uploads are accepted, got {}",
                file.mime
            )));
        }
        if file.size_bytes > self.max_upload_bytes {
            return Err(IngestError::InvalidArgument(format!(
                "{} is {} bytes, limit is {}",
                file.filename, file.size_bytes, self.max_upload_bytes
            )));
        }
        if tags.owner_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("upload needs an owner".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let storage_path = self.upload_dir.join(format!("{id}.pdf"));
        tokio::fs::copy(&file.source, &storage_path).await?;

        let now = Utc::now();
        let document = Document {
            id: id.clone(),
            owner_id: tags.owner_id.clone(),
            filename: file.filename,
            mime: file.mime,
            size_bytes: file.size_bytes,
            storage_path,
            category: tags.category(),
            state: tag(tags.state.as_deref()),
            district: tag(tags.district.as_deref()),
            status: DocumentStatus::Queued,
            progress: Progress::queued(),
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };

        if let Err(error) = self.records.insert_document(document.clone()).await {
            remove_stored_file(&document.storage_path).await;
            return Err(error.into());
        }

        self.queue.enqueue(&id).await?;
        info!(
            document_id = %id,
            filename = %document.filename,
            category = %document.category,
            "registered upload"
        );
        Ok(document)
    }

    /// Re-enqueues documents that never settled, oldest first.
    pub async fn requeue_stale(&self) -> Result<Vec<String>, IngestError> {
        let mut stale = self
            .records
            .list_documents()
            .await?
            .into_iter()
            .filter(|document| !document.status.is_settled())
            .collect::<Vec<_>>();
        stale.reverse();

        let mut requeued = Vec::with_capacity(stale.len());
        for document in stale {
            self.queue.enqueue(&document.id).await?;
            info!(document_id = %document.id, status = document.status.as_str(), "requeued stale document");
            requeued.push(document.id);
        }
        Ok(requeued)
    }

    /// Removes vector points first, then the stored file and the record.
    /// A failed vector delete leaves everything in place.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        let document = self
            .records
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;

        if document.status == DocumentStatus::Processing {
            return Err(IngestError::Conflict(format!(
                "document {document_id} is processing; delete it after ingestion settles"
            )));
        }

        self.vectors
            .delete_points(&VectorFilter::document(document_id))
            .await
            .map_err(IngestError::VectorStore)?;

        remove_stored_file(&document.storage_path).await;

        if !self.records.delete_document(document_id).await? {
            return Err(IngestError::NotFound(document_id.to_string()));
        }

        info!(document_id, "deleted document");
        Ok(())
    }

    pub async fn document_status(&self, document_id: &str) -> Result<DocumentStatusView, IngestError> {
        self.records
            .get_document(document_id)
            .await?
            .map(|document| DocumentStatusView::from(&document))
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>, IngestError> {
        Ok(self.records.list_documents().await?)
    }
}

async fn remove_stored_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "could not remove stored file"),
    }
}
