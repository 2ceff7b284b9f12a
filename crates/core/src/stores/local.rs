use crate::error::StoreError;
use crate::models::{
    ConversationThread, Document, DocumentStatus, DocumentUpdate, Message, NewMessage, Scope,
};
use crate::traits::{ConversationStore, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    documents: BTreeMap<String, Document>,
    #[serde(default)]
    threads: BTreeMap<String, ConversationThread>,
    #[serde(default)]
    messages: Vec<Message>,
}

/// Document, thread and message records kept in memory and, when opened
/// from a path, written back to a JSON file after every mutation.
#[derive(Debug)]
pub struct LocalRecordStore {
    records: RwLock<Records>,
    path: Option<PathBuf>,
}

impl LocalRecordStore {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            path: None,
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Records::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Records::default(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    async fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(records)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// Persists `next`, then makes it the visible state.
    async fn commit(&self, current: &mut Records, next: Records) -> Result<(), StoreError> {
        self.persist(&next).await?;
        *current = next;
        Ok(())
    }
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl DocumentStore for LocalRecordStore {
    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict(format!(
                "document {} already exists",
                document.id
            )));
        }
        let mut next = records.clone();
        next.documents.insert(document.id.clone(), document);
        self.commit(&mut records, next).await
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.records.read().await.documents.get(id).cloned())
    }

    async fn update_document(
        &self,
        id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, StoreError> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        let document = next
            .documents
            .get_mut(id)
            .ok_or_else(|| not_found("document", id))?;

        if let Some(status) = update.status {
            if !document.status.can_transition_to(status) {
                return Err(StoreError::Conflict(format!(
                    "document {id} cannot move from {} to {}",
                    document.status.as_str(),
                    status.as_str()
                )));
            }
            document.status = status;
        }
        if let Some(progress) = update.progress {
            document.progress = progress;
        }
        if let Some(message) = update.error_message {
            document.error_message = message;
        }
        document.updated_at = Utc::now();

        let updated = document.clone();
        self.commit(&mut records, next).await?;
        Ok(updated)
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let records = self.records.read().await;
        let mut documents = records.documents.values().cloned().collect::<Vec<_>>();
        documents.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(documents)
    }

    async fn find_ready(&self, scope: &Scope) -> Result<Vec<Document>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .documents
            .values()
            .filter(|document| document.status == DocumentStatus::Ready)
            .filter(|document| scope.matches_document(document))
            .cloned()
            .collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if !records.documents.contains_key(id) {
            return Ok(false);
        }
        let mut next = records.clone();
        next.documents.remove(id);
        self.commit(&mut records, next).await?;
        Ok(true)
    }
}

#[async_trait]
impl ConversationStore for LocalRecordStore {
    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, StoreError> {
        Ok(self.records.read().await.threads.get(id).cloned())
    }

    async fn latest_thread(
        &self,
        owner_id: &str,
        scope: &Scope,
    ) -> Result<Option<ConversationThread>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .threads
            .values()
            .filter(|thread| thread.owner_id == owner_id && &thread.scope == scope)
            .max_by_key(|thread| thread.updated_at)
            .cloned())
    }

    async fn create_thread(
        &self,
        owner_id: &str,
        scope: &Scope,
    ) -> Result<ConversationThread, StoreError> {
        let now = Utc::now();
        let thread = ConversationThread {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            scope: scope.clone(),
            created_at: now,
            updated_at: now,
        };

        let mut records = self.records.write().await;
        let mut next = records.clone();
        next.threads.insert(thread.id.clone(), thread.clone());
        self.commit(&mut records, next).await?;
        Ok(thread)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        let thread = next
            .threads
            .get_mut(&message.thread_id)
            .ok_or_else(|| not_found("thread", &message.thread_id))?;

        // keep creation order strict even when the clock does not advance
        let now = Utc::now().max(thread.updated_at);
        thread.updated_at = now;

        let stored = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: message.thread_id,
            role: message.role,
            content: message.content,
            citations: message.citations,
            created_at: now,
        };
        next.messages.push(stored.clone());
        self.commit(&mut records, next).await?;
        Ok(stored)
    }

    async fn messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .messages
            .iter()
            .filter(|message| message.thread_id == thread_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Progress, Role};
    use tempfile::tempdir;

    fn document(id: &str, category: &str, district: Option<&str>) -> Document {
        let now = Utc::now();
        Document {
            id: id.to_string(),
            owner_id: "admin".to_string(),
            filename: format!("{id}.pdf"),
            mime: "application/pdf".to_string(),
            size_bytes: 100,
            storage_path: PathBuf::from(format!("/uploads/{id}.pdf")),
            category: category.to_string(),
            state: Some("kerala".to_string()),
            district: district.map(str::to_string),
            status: DocumentStatus::Queued,
            progress: Progress::queued(),
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn make_ready(store: &LocalRecordStore, id: &str) {
        store
            .update_document(id, DocumentUpdate::started())
            .await
            .expect("processing");
        store
            .update_document(id, DocumentUpdate::ready(1, 1))
            .await
            .expect("ready");
    }

    #[tokio::test]
    async fn records_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("records.json");

        let store = LocalRecordStore::open(&path).await?;
        store.insert_document(document("doc-1", "health", None)).await?;
        let thread = store.create_thread("user-1", &Scope::global()).await?;
        drop(store);

        let reopened = LocalRecordStore::open(&path).await?;
        assert!(reopened.get_document("doc-1").await?.is_some());
        assert_eq!(reopened.get_thread(&thread.id).await?, Some(thread));
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_leaves_records_unchanged() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("records.json");
        let store = LocalRecordStore::open(&path).await?;
        store.insert_document(document("doc-1", "health", None)).await?;

        // a directory at the staging path makes the next write fail
        std::fs::create_dir(path.with_extension("json.tmp"))?;

        let result = store.update_document("doc-1", DocumentUpdate::started()).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
        let held = store.get_document("doc-1").await?.ok_or("document missing")?;
        assert_eq!(held.status, DocumentStatus::Queued);

        assert!(store.insert_document(document("doc-2", "health", None)).await.is_err());
        assert!(store.get_document("doc-2").await?.is_none());

        let reopened = LocalRecordStore::open(&path).await?;
        let persisted = reopened.get_document("doc-1").await?.ok_or("document missing")?;
        assert_eq!(persisted.status, DocumentStatus::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn backward_status_change_is_rejected() {
        let store = LocalRecordStore::in_memory();
        store
            .insert_document(document("doc-1", "health", None))
            .await
            .expect("insert");
        make_ready(&store, "doc-1").await;

        let result = store
            .update_document(
                "doc-1",
                DocumentUpdate {
                    status: Some(DocumentStatus::Queued),
                    ..DocumentUpdate::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn find_ready_applies_scope() {
        let store = LocalRecordStore::in_memory();
        for (id, category, district) in [
            ("health-kollam", "health", Some("kollam")),
            ("health-kannur", "health", Some("kannur")),
            ("education-kollam", "education", Some("kollam")),
            ("health-queued", "health", Some("kollam")),
        ] {
            store
                .insert_document(document(id, category, district))
                .await
                .expect("insert");
        }
        for id in ["health-kollam", "health-kannur", "education-kollam"] {
            make_ready(&store, id).await;
        }

        let scoped = store
            .find_ready(&Scope::new(Some("health"), Some("kerala"), Some("kollam")))
            .await
            .expect("query");
        let ids = scoped.iter().map(|doc| doc.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["health-kollam"]);

        let everything = store.find_ready(&Scope::global()).await.expect("query");
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn latest_thread_is_scoped_and_most_recent() {
        let store = LocalRecordStore::in_memory();
        let health = Scope::new(Some("health"), None, None);

        let older = store.create_thread("user-1", &health).await.expect("thread");
        let newer = store.create_thread("user-1", &health).await.expect("thread");
        store.create_thread("user-2", &health).await.expect("thread");
        store
            .create_thread("user-1", &Scope::global())
            .await
            .expect("thread");

        store
            .append_message(NewMessage {
                thread_id: older.id.clone(),
                role: Role::User,
                content: "hello".to_string(),
                citations: Vec::new(),
            })
            .await
            .expect("message");

        let latest = store
            .latest_thread("user-1", &health)
            .await
            .expect("query")
            .expect("thread exists");
        assert_eq!(latest.id, older.id);
        assert_ne!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn messages_keep_creation_order() {
        let store = LocalRecordStore::in_memory();
        let thread = store
            .create_thread("user-1", &Scope::global())
            .await
            .expect("thread");

        for (role, content) in [(Role::User, "question"), (Role::Assistant, "answer")] {
            store
                .append_message(NewMessage {
                    thread_id: thread.id.clone(),
                    role,
                    content: content.to_string(),
                    citations: Vec::new(),
                })
                .await
                .expect("message");
        }

        let messages = store.messages(&thread.id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[0].created_at <= messages[1].created_at);
    }

    #[tokio::test]
    async fn message_for_unknown_thread_is_not_found() {
        let store = LocalRecordStore::in_memory();
        let result = store
            .append_message(NewMessage {
                thread_id: "missing".to_string(),
                role: Role::User,
                content: "hello".to_string(),
                citations: Vec::new(),
            })
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { kind: "thread", .. })));
    }
}
