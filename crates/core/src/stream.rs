use crate::models::Citation;
use futures::stream::BoxStream;
use serde_json::{json, Value};

/// Named events pushed to a client while a question is answered. Exactly
/// one of `Done` or `Error` ends a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ready,
    Thread { thread_id: String },
    Token { delta: String },
    Citations { citations: Vec<Citation> },
    Done,
    Error { message: String },
}

pub type EventStream = BoxStream<'static, StreamEvent>;

impl StreamEvent {
    pub fn token(delta: impl Into<String>) -> Self {
        StreamEvent::Token {
            delta: delta.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        StreamEvent::Error {
            message: message.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Ready => "ready",
            StreamEvent::Thread { .. } => "thread",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Citations { .. } => "citations",
            StreamEvent::Done => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::Ready => json!({ "ok": true }),
            StreamEvent::Thread { thread_id } => json!({ "threadId": thread_id }),
            StreamEvent::Token { delta } => json!({ "delta": delta }),
            StreamEvent::Citations { citations } => json!({ "citations": citations }),
            StreamEvent::Done => json!({}),
            StreamEvent::Error { message } => json!({ "message": message }),
        }
    }

    /// `text/event-stream` framing.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frames_carry_name_and_json() {
        assert_eq!(
            StreamEvent::token("Hel").to_sse(),
            "event: token\ndata: {\"delta\":\"Hel\"}\n\n"
        );
        assert_eq!(StreamEvent::Done.to_sse(), "event: done\ndata: {}\n\n");
        assert_eq!(
            StreamEvent::Thread {
                thread_id: "t-1".to_string()
            }
            .data()["threadId"],
            "t-1"
        );
    }

    #[test]
    fn citations_serialize_camel_case() {
        let event = StreamEvent::Citations {
            citations: vec![Citation {
                document_id: "doc-1".to_string(),
                document_name: "report.pdf".to_string(),
                page_number: 3,
                score: 0.5,
            }],
        };
        let data = event.data();
        assert_eq!(data["citations"][0]["documentName"], "report.pdf");
        assert_eq!(data["citations"][0]["pageNumber"], 3);
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(!StreamEvent::Ready.is_terminal());
        assert!(!StreamEvent::token("x").is_terminal());
    }
}
