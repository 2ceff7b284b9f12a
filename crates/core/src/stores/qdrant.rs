use crate::error::BackendError;
use crate::filter::{VectorFilter, VectorQuery, INDEXED_PAYLOAD_KEYS};
use crate::models::{ChunkPayload, ScoredPoint, VectorPoint};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "qdrant";

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: Value,
    score: f32,
    payload: Option<ChunkPayload>,
}

impl QdrantStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, BackendError> {
        let parsed = Url::parse(endpoint)?;
        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            collection: collection.into(),
            api_key: None,
            client: Client::new(),
            vector_size,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    /// Creates the collection when missing and the keyword payload indexes
    /// used by filtered search.
    pub async fn ensure_collection(&self) -> Result<(), BackendError> {
        let existing = self
            .authorize(self.client.get(self.collection_url("")))
            .send()
            .await?;

        match existing.status() {
            status if status.is_success() => {
                debug!(collection = %self.collection, "qdrant collection exists");
            }
            StatusCode::NOT_FOUND => {
                let response = self
                    .authorize(self.client.put(self.collection_url("")))
                    .json(&json!({
                        "vectors": { "size": self.vector_size, "distance": "Cosine" },
                    }))
                    .send()
                    .await?;
                ensure_success(response).await?;
                info!(
                    collection = %self.collection,
                    vector_size = self.vector_size,
                    "created qdrant collection"
                );
            }
            _ => return Err(response_error(existing).await),
        }

        for field in INDEXED_PAYLOAD_KEYS {
            let response = self
                .authorize(self.client.put(self.collection_url("/index?wait=true")))
                .json(&json!({ "field_name": field, "field_schema": "keyword" }))
                .send()
                .await?;
            ensure_success(response).await?;
        }

        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), BackendError> {
        if vector.len() != self.vector_size {
            return Err(BackendError::DimensionMismatch {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(response_error(response).await)
    }
}

async fn response_error(response: Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    BackendError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    }
}

pub(crate) fn points_body(points: &[VectorPoint]) -> Result<Value, BackendError> {
    let points = points
        .iter()
        .map(|point| -> Result<Value, BackendError> {
            Ok(json!({
                "id": point.id.to_string(),
                "vector": point.vector,
                "payload": serde_json::to_value(&point.payload)?,
            }))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "points": points }))
}

fn parse_hits(body: Value) -> Result<Vec<ScoredPoint>, BackendError> {
    let parsed: SearchResponse = serde_json::from_value(body)?;

    parsed
        .result
        .into_iter()
        .map(|hit| -> Result<ScoredPoint, BackendError> {
            let id = match hit.id {
                Value::String(id) => id,
                other => other.to_string(),
            };
            let payload = hit.payload.ok_or_else(|| BackendError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("search hit {id} has no payload"),
            })?;
            Ok(ScoredPoint {
                id,
                score: hit.score,
                payload,
            })
        })
        .collect()
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert_points(&self, points: &[VectorPoint]) -> Result<(), BackendError> {
        if points.is_empty() {
            return Ok(());
        }

        for point in points {
            self.check_dimension(&point.vector)?;
        }

        let response = self
            .authorize(self.client.put(self.collection_url("/points?wait=true")))
            .json(&points_body(points)?)
            .send()
            .await?;
        ensure_success(response).await?;

        debug!(collection = %self.collection, count = points.len(), "upserted points");
        Ok(())
    }

    async fn search_points(&self, query: &VectorQuery) -> Result<Vec<ScoredPoint>, BackendError> {
        self.check_dimension(&query.vector)?;

        let response = self
            .authorize(self.client.post(self.collection_url("/points/search")))
            .json(&json!({
                "vector": query.vector,
                "limit": query.limit,
                "filter": query.filter,
                "with_payload": true,
            }))
            .send()
            .await?;

        let body: Value = ensure_success(response).await?.json().await?;
        parse_hits(body)
    }

    async fn delete_points(&self, filter: &VectorFilter) -> Result<(), BackendError> {
        let response = self
            .authorize(self.client.post(self.collection_url("/points/delete?wait=true")))
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn payload() -> ChunkPayload {
        ChunkPayload {
            document_id: "doc-1".to_string(),
            category: "health".to_string(),
            state: Some("kerala".to_string()),
            district: None,
            page_number: 3,
            chunk_index: 1,
            text: "Immunisation coverage rose to 92%.".to_string(),
        }
    }

    #[test]
    fn endpoint_must_be_a_url() {
        assert!(QdrantStore::new("not a url", "chunks", 4).is_err());
        let store = QdrantStore::new("http://localhost:6333/", "chunks", 4).expect("valid url");
        assert_eq!(
            store.collection_url("/points/search"),
            "http://localhost:6333/collections/chunks/points/search"
        );
    }

    #[test]
    fn upsert_body_carries_payload_fields() {
        let id = Uuid::new_v4();
        let body = points_body(&[VectorPoint {
            id,
            vector: vec![0.5, 0.5],
            payload: payload(),
        }])
        .expect("body builds");

        let point = &body["points"][0];
        assert_eq!(point["id"], id.to_string());
        assert_eq!(point["payload"]["documentId"], "doc-1");
        assert_eq!(point["payload"]["pageNumber"], 3);
        assert_eq!(point["payload"]["state"], "kerala");
        assert!(point["payload"].get("district").is_none());
    }

    #[test]
    fn search_hits_keep_store_order() {
        let body = json!({
            "result": [
                {"id": "b1c2", "score": 0.91, "payload": serde_json::to_value(payload()).expect("payload")},
                {"id": 7, "score": 0.42, "payload": serde_json::to_value(payload()).expect("payload")}
            ],
            "status": "ok"
        });

        let hits = parse_hits(body).expect("hits parse");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "b1c2");
        assert_eq!(hits[1].id, "7");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].payload.page_number, 3);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected_before_sending() {
        let store = QdrantStore::new("http://localhost:6333", "chunks", 4).expect("valid url");
        let result = store
            .upsert_points(&[VectorPoint {
                id: Uuid::new_v4(),
                vector: vec![1.0, 0.0],
                payload: payload(),
            }])
            .await;
        assert!(matches!(
            result,
            Err(BackendError::DimensionMismatch { expected: 4, actual: 2 })
        ));
    }
}
