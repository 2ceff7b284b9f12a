use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_CATEGORY: &str = "others";
pub const WILDCARD_CATEGORY: &str = "all";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Lifecycle moves forward only. Entering `Processing` again is how a
    /// fresh ingestion job re-runs a document that was already handled.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (_, Processing) | (Queued, Failed) | (Processing, Ready) | (Processing, Failed)
        )
    }

    pub fn is_settled(self) -> bool {
        matches!(self, DocumentStatus::Ready | DocumentStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IngestStage {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "extract")]
    Extract,
    #[serde(rename = "embed+upsert")]
    EmbedUpsert,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub stage: IngestStage,
    pub pages_done: u32,
    pub chunks_done: u64,
}

impl Progress {
    pub fn queued() -> Self {
        Self::at(IngestStage::Queued, 0, 0)
    }

    pub fn started() -> Self {
        Self::at(IngestStage::Extract, 0, 0)
    }

    pub fn at(stage: IngestStage, pages_done: u32, chunks_done: u64) -> Self {
        Self {
            stage,
            pages_done,
            chunks_done,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub mime: String,
    pub size_bytes: u64,
    pub storage_path: PathBuf,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    pub status: DocumentStatus,
    pub progress: Progress,
    #[serde(default)]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial write applied to a stored [`Document`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub status: Option<DocumentStatus>,
    pub progress: Option<Progress>,
    pub error_message: Option<String>,
}

impl DocumentUpdate {
    pub fn started() -> Self {
        Self {
            status: Some(DocumentStatus::Processing),
            progress: Some(Progress::started()),
            error_message: Some(String::new()),
        }
    }

    pub fn progress(progress: Progress) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn ready(pages_done: u32, chunks_done: u64) -> Self {
        Self {
            status: Some(DocumentStatus::Ready),
            progress: Some(Progress::at(IngestStage::Done, pages_done, chunks_done)),
            error_message: Some(String::new()),
        }
    }

    pub fn failed(pages_done: u32, chunks_done: u64, message: impl Into<String>) -> Self {
        Self {
            status: Some(DocumentStatus::Failed),
            progress: Some(Progress::at(IngestStage::Failed, pages_done, chunks_done)),
            error_message: Some(message.into()),
        }
    }
}

/// Category and region restriction shared by threads, record queries and
/// vector filters. Empty tags and the `all` category mean "unrestricted".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionFilter<'a> {
    District(&'a str),
    State(&'a str),
    Any,
}

impl Scope {
    pub fn new(category: Option<&str>, state: Option<&str>, district: Option<&str>) -> Self {
        let category = non_empty(category)
            .map(|value| value.to_lowercase())
            .filter(|value| value != WILDCARD_CATEGORY);

        Self {
            category,
            state: non_empty(state).map(str::to_string),
            district: non_empty(district).map(str::to_string),
        }
    }

    pub fn global() -> Self {
        Self::default()
    }

    /// District is more specific than state and replaces it.
    pub fn region(&self) -> RegionFilter<'_> {
        match (&self.district, &self.state) {
            (Some(district), _) => RegionFilter::District(district),
            (None, Some(state)) => RegionFilter::State(state),
            (None, None) => RegionFilter::Any,
        }
    }

    pub fn matches_tags(
        &self,
        category: &str,
        state: Option<&str>,
        district: Option<&str>,
    ) -> bool {
        if let Some(wanted) = &self.category {
            if wanted != category {
                return false;
            }
        }

        match self.region() {
            RegionFilter::District(wanted) => district == Some(wanted),
            RegionFilter::State(wanted) => state == Some(wanted),
            RegionFilter::Any => true,
        }
    }

    pub fn matches_document(&self, document: &Document) -> bool {
        self.matches_tags(
            &document.category,
            document.state.as_deref(),
            document.district.as_deref(),
        )
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Metadata stored next to every vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub document_id: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    pub page_number: u32,
    pub chunk_index: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationThread {
    pub id: String,
    pub owner_id: String,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_id: String,
    pub document_name: String,
    pub page_number: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub id: Uuid,
    pub document_id: String,
    pub attempt: u32,
}

impl IngestJob {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReingestPolicy {
    /// Every run writes fresh points; older points remain until the
    /// document is deleted.
    #[default]
    Append,
    /// Remove the document's points before the first upsert of a run.
    Replace,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub batch_size: usize,
    pub reingest: ReingestPolicy,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_200,
            chunk_overlap: 200,
            batch_size: 64,
            reingest: ReingestPolicy::Append,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub system_instruction: String,
    pub no_documents_message: String,
    pub no_context_message: String,
    pub empty_answer_placeholder: String,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            system_instruction: "You are a helpful assistant. Answer ONLY using the provided \
                context from verified PDFs. If the answer is not in context, say it is not \
                available in verified documents. Keep the answer clear and practical."
                .to_string(),
            no_documents_message:
                "No verified documents are available for the selected filters yet.".to_string(),
            no_context_message: "Information is not available in verified uploaded documents."
                .to_string(),
            empty_answer_placeholder: "(no output)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use DocumentStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Ready));
        assert!(Processing.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Processing));
        assert!(!Ready.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Queued.can_transition_to(Ready));
    }

    #[test]
    fn scope_normalizes_wildcards_and_blank_tags() {
        let scope = Scope::new(Some(" Health "), Some(""), Some("  "));
        assert_eq!(scope.category.as_deref(), Some("health"));
        assert_eq!(scope.region(), RegionFilter::Any);

        let everything = Scope::new(Some("ALL"), None, None);
        assert_eq!(everything, Scope::global());
    }

    #[test]
    fn district_supersedes_state() {
        let scope = Scope::new(None, Some("kerala"), Some("ernakulam"));
        assert_eq!(scope.region(), RegionFilter::District("ernakulam"));
        assert!(scope.matches_tags("health", Some("other-state"), Some("ernakulam")));
        assert!(!scope.matches_tags("health", Some("kerala"), Some("kollam")));
    }

    #[test]
    fn progress_serializes_with_wire_names() {
        let value = serde_json::to_value(Progress::at(IngestStage::EmbedUpsert, 3, 64))
            .expect("progress serializes");
        assert_eq!(
            value,
            serde_json::json!({"stage": "embed+upsert", "pagesDone": 3, "chunksDone": 64})
        );
    }
}
