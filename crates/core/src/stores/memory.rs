use crate::embeddings::cosine_similarity;
use crate::error::BackendError;
use crate::filter::{VectorFilter, VectorQuery};
use crate::models::{ScoredPoint, VectorPoint};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Brute-force cosine index held in memory. Records its call counts so
/// tests can assert on how the pipeline used it.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    points: RwLock<Vec<VectorPoint>>,
    upsert_sizes: RwLock<Vec<usize>>,
    searches: AtomicUsize,
    deletes: AtomicUsize,
    min_score: Option<f32>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hits scoring below `min_score` are dropped, like a similarity floor.
    pub fn with_min_score(min_score: f32) -> Self {
        Self {
            min_score: Some(min_score),
            ..Self::default()
        }
    }

    pub async fn points(&self) -> Vec<VectorPoint> {
        self.points.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    pub async fn upsert_sizes(&self) -> Vec<usize> {
        self.upsert_sizes.read().await.clone()
    }

    pub fn search_calls(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert_points(&self, points: &[VectorPoint]) -> Result<(), BackendError> {
        let mut stored = self.points.write().await;
        for point in points {
            match stored.iter_mut().find(|existing| existing.id == point.id) {
                Some(existing) => *existing = point.clone(),
                None => stored.push(point.clone()),
            }
        }
        self.upsert_sizes.write().await.push(points.len());
        Ok(())
    }

    async fn search_points(&self, query: &VectorQuery) -> Result<Vec<ScoredPoint>, BackendError> {
        self.searches.fetch_add(1, Ordering::SeqCst);

        let stored = self.points.read().await;
        let mut hits = stored
            .iter()
            .filter(|point| query.filter.matches(&point.payload))
            .map(|point| ScoredPoint {
                id: point.id.to_string(),
                score: cosine_similarity(&query.vector, &point.vector),
                payload: point.payload.clone(),
            })
            .filter(|hit| self.min_score.map_or(true, |floor| hit.score >= floor))
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn delete_points(&self, filter: &VectorFilter) -> Result<(), BackendError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.points
            .write()
            .await
            .retain(|point| !filter.matches(&point.payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_filter;
    use crate::models::{ChunkPayload, Scope};
    use uuid::Uuid;

    fn point(document_id: &str, category: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: Uuid::new_v4(),
            vector,
            payload: ChunkPayload {
                document_id: document_id.to_string(),
                category: category.to_string(),
                state: None,
                district: None,
                page_number: 1,
                chunk_index: 0,
                text: format!("{document_id} text"),
            },
        }
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_within_filter() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_points(&[
                point("a", "health", vec![1.0, 0.0]),
                point("b", "health", vec![0.7, 0.7]),
                point("c", "education", vec![1.0, 0.0]),
            ])
            .await
            .expect("upsert succeeds");

        let hits = index
            .search_points(&VectorQuery {
                vector: vec![1.0, 0.0],
                limit: 10,
                filter: build_filter(
                    &["a".to_string(), "b".to_string(), "c".to_string()],
                    &Scope::new(Some("health"), None, None),
                ),
            })
            .await
            .expect("search succeeds");

        let ids = hits.iter().map(|hit| hit.payload.document_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.search_calls(), 1);
    }

    #[tokio::test]
    async fn similarity_floor_drops_weak_hits() {
        let index = MemoryVectorIndex::with_min_score(0.9);
        index
            .upsert_points(&[point("a", "health", vec![0.0, 1.0])])
            .await
            .expect("upsert succeeds");

        let hits = index
            .search_points(&VectorQuery {
                vector: vec![1.0, 0.0],
                limit: 10,
                filter: build_filter(&["a".to_string()], &Scope::global()),
            })
            .await
            .expect("search succeeds");

        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_only_matching_document() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_points(&[point("a", "health", vec![1.0]), point("b", "health", vec![1.0])])
            .await
            .expect("upsert succeeds");

        index
            .delete_points(&VectorFilter::document("a"))
            .await
            .expect("delete succeeds");

        let remaining = index.points().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload.document_id, "b");
    }
}
