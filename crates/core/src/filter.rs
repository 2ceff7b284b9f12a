use crate::models::{ChunkPayload, RegionFilter, Scope};
use serde::Serialize;

pub const DOCUMENT_ID_KEY: &str = "documentId";
pub const CATEGORY_KEY: &str = "category";
pub const STATE_KEY: &str = "state";
pub const DISTRICT_KEY: &str = "district";

/// Payload fields that need a keyword index for filtered search.
pub const INDEXED_PAYLOAD_KEYS: [&str; 4] = [DOCUMENT_ID_KEY, CATEGORY_KEY, STATE_KEY, DISTRICT_KEY];

/// Conjunction of payload conditions, serialized in Qdrant's filter shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCondition {
    pub key: &'static str,
    #[serde(rename = "match")]
    pub matcher: Match,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Match {
    Value { value: String },
    Any { any: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub limit: usize,
    pub filter: VectorFilter,
}

impl FieldCondition {
    fn value(key: &'static str, value: &str) -> Self {
        Self {
            key,
            matcher: Match::Value {
                value: value.to_string(),
            },
        }
    }

    fn any(key: &'static str, values: &[String]) -> Self {
        Self {
            key,
            matcher: Match::Any {
                any: values.to_vec(),
            },
        }
    }

    fn matches(&self, payload: &ChunkPayload) -> bool {
        let field = match self.key {
            DOCUMENT_ID_KEY => Some(payload.document_id.as_str()),
            CATEGORY_KEY => Some(payload.category.as_str()),
            STATE_KEY => payload.state.as_deref(),
            DISTRICT_KEY => payload.district.as_deref(),
            _ => None,
        };

        match (&self.matcher, field) {
            (Match::Value { value }, Some(field)) => value == field,
            (Match::Any { any }, Some(field)) => any.iter().any(|value| value == field),
            (_, None) => false,
        }
    }
}

impl VectorFilter {
    /// Every point belonging to one document.
    pub fn document(document_id: &str) -> Self {
        Self {
            must: vec![FieldCondition::value(DOCUMENT_ID_KEY, document_id)],
        }
    }

    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        self.must.iter().all(|condition| condition.matches(payload))
    }
}

/// Restricts a search to `eligible_ids` and the scope's category/region.
pub fn build_filter(eligible_ids: &[String], scope: &Scope) -> VectorFilter {
    let mut must = vec![FieldCondition::any(DOCUMENT_ID_KEY, eligible_ids)];

    if let Some(category) = &scope.category {
        must.push(FieldCondition::value(CATEGORY_KEY, category));
    }

    match scope.region() {
        RegionFilter::District(district) => {
            must.push(FieldCondition::value(DISTRICT_KEY, district))
        }
        RegionFilter::State(state) => must.push(FieldCondition::value(STATE_KEY, state)),
        RegionFilter::Any => {}
    }

    VectorFilter { must }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(document_id: &str, category: &str, state: Option<&str>, district: Option<&str>) -> ChunkPayload {
        ChunkPayload {
            document_id: document_id.to_string(),
            category: category.to_string(),
            state: state.map(str::to_string),
            district: district.map(str::to_string),
            page_number: 1,
            chunk_index: 0,
            text: "text".to_string(),
        }
    }

    #[test]
    fn global_scope_only_restricts_documents() {
        let filter = build_filter(&["a".to_string(), "b".to_string()], &Scope::new(Some("all"), None, None));
        assert_eq!(
            serde_json::to_value(&filter).expect("filter serializes"),
            json!({"must": [{"key": "documentId", "match": {"any": ["a", "b"]}}]})
        );
    }

    #[test]
    fn district_replaces_state_condition() {
        let scope = Scope::new(Some("health"), Some("kerala"), Some("kollam"));
        let filter = build_filter(&["a".to_string()], &scope);
        assert_eq!(
            serde_json::to_value(&filter).expect("filter serializes"),
            json!({"must": [
                {"key": "documentId", "match": {"any": ["a"]}},
                {"key": "category", "match": {"value": "health"}},
                {"key": "district", "match": {"value": "kollam"}}
            ]})
        );
    }

    #[test]
    fn state_is_used_without_district() {
        let filter = build_filter(&["a".to_string()], &Scope::new(None, Some("kerala"), None));
        assert_eq!(filter.must.len(), 2);
        assert_eq!(filter.must[1].key, STATE_KEY);
    }

    #[test]
    fn filter_evaluation_follows_conditions() {
        let scope = Scope::new(Some("health"), None, Some("kollam"));
        let filter = build_filter(&["a".to_string()], &scope);

        assert!(filter.matches(&payload("a", "health", Some("kerala"), Some("kollam"))));
        assert!(!filter.matches(&payload("a", "education", Some("kerala"), Some("kollam"))));
        assert!(!filter.matches(&payload("a", "health", Some("kerala"), Some("kannur"))));
        assert!(!filter.matches(&payload("a", "health", Some("kerala"), None)));
        assert!(!filter.matches(&payload("b", "health", Some("kerala"), Some("kollam"))));
    }

    #[test]
    fn empty_eligible_set_matches_nothing() {
        let filter = build_filter(&[], &Scope::global());
        assert!(!filter.matches(&payload("a", "health", None, None)));
    }

    #[test]
    fn document_filter_matches_single_document() {
        let filter = VectorFilter::document("a");
        assert!(filter.matches(&payload("a", "health", None, None)));
        assert!(!filter.matches(&payload("b", "health", None, None)));
    }
}
