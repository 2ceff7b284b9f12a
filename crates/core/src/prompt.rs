use crate::models::{Citation, ScoredPoint};
use std::collections::HashMap;

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Display names for the documents a search may hit, keyed by id.
pub type DocumentNames = HashMap<String, String>;

fn display_name<'a>(names: &'a DocumentNames, document_id: &'a str) -> &'a str {
    names
        .get(document_id)
        .map(String::as_str)
        .unwrap_or(document_id)
}

/// Joins hit texts in the order the store ranked them, each headed by its
/// source document and page.
pub fn build_context(hits: &[ScoredPoint], names: &DocumentNames) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "Document: {}\nPage {}:\n{}",
                display_name(names, &hit.payload.document_id),
                hit.payload.page_number,
                hit.payload.text
            )
        })
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!("Context:\n{context}\n\nQuestion:\n{question}")
}

pub fn citations(hits: &[ScoredPoint], names: &DocumentNames) -> Vec<Citation> {
    hits.iter()
        .map(|hit| Citation {
            document_id: hit.payload.document_id.clone(),
            document_name: display_name(names, &hit.payload.document_id).to_string(),
            page_number: hit.payload.page_number,
            score: hit.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkPayload;

    fn hit(document_id: &str, page_number: u32, score: f32, text: &str) -> ScoredPoint {
        ScoredPoint {
            id: format!("{document_id}-{page_number}"),
            score,
            payload: ChunkPayload {
                document_id: document_id.to_string(),
                category: "health".to_string(),
                state: None,
                district: None,
                page_number,
                chunk_index: 0,
                text: text.to_string(),
            },
        }
    }

    fn names() -> DocumentNames {
        HashMap::from([("doc-1".to_string(), "Health Survey 2023.pdf".to_string())])
    }

    #[test]
    fn context_sections_keep_rank_order() {
        let hits = vec![
            hit("doc-1", 4, 0.9, "Infant mortality fell."),
            hit("doc-2", 1, 0.5, "Clinics opened."),
        ];

        let context = build_context(&hits, &names());

        assert_eq!(
            context,
            "Document: Health Survey 2023.pdf\nPage 4:\nInfant mortality fell.\n\n---\n\n\
             Document: doc-2\nPage 1:\nClinics opened."
        );
    }

    #[test]
    fn prompt_wraps_context_and_question() {
        assert_eq!(
            build_prompt("ctx", "What changed?"),
            "Context:\nctx\n\nQuestion:\nWhat changed?"
        );
    }

    #[test]
    fn citations_fall_back_to_document_id() {
        let cited = citations(&[hit("doc-1", 2, 0.8, "a"), hit("doc-9", 3, 0.4, "b")], &names());

        assert_eq!(cited[0].document_name, "Health Survey 2023.pdf");
        assert_eq!(cited[0].page_number, 2);
        assert_eq!(cited[1].document_name, "doc-9");
        assert!((cited[1].score - 0.4).abs() < f32::EPSILON);
    }
}
