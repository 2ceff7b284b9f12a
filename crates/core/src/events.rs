use crate::error::PublishError;
use crate::models::{Document, DocumentStatus, Progress};
use crate::traits::ProgressPublisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const ADMIN_DOCUMENTS_CHANNEL: &str = "admin:documents";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Progress,
    Ready,
    Failed,
}

/// Status change notification. The record store stays the source of truth;
/// these are best-effort.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub document_id: String,
    pub status: DocumentStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_document(document: &Document) -> Self {
        let kind = match document.status {
            DocumentStatus::Ready => ProgressKind::Ready,
            DocumentStatus::Failed => ProgressKind::Failed,
            DocumentStatus::Queued | DocumentStatus::Processing => ProgressKind::Progress,
        };

        let error = (!document.error_message.is_empty()).then(|| document.error_message.clone());

        Self {
            kind,
            document_id: document.id.clone(),
            status: document.status,
            progress: document.progress,
            error,
            updated_at: document.updated_at,
        }
    }
}

/// In-process fan-out. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ProgressPublisher for BroadcastPublisher {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PublishError> {
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl ProgressPublisher for TracingPublisher {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(event).map_err(|error| PublishError(error.to_string()))?;
        info!(
            channel = ADMIN_DOCUMENTS_CHANNEL,
            document_id = %event.document_id,
            kind = ?event.kind,
            %payload,
            "document event"
        );
        Ok(())
    }
}

/// Publishes to every sink; one failing sink does not hide the event from
/// the others.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn ProgressPublisher>>,
}

impl FanoutPublisher {
    pub fn new(sinks: Vec<Arc<dyn ProgressPublisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ProgressPublisher for FanoutPublisher {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PublishError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(error) = sink.publish(event).await {
                warn!(document_id = %event.document_id, %error, "progress sink failed");
                failures.push(error.0);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError(failures.join("; ")))
        }
    }
}
