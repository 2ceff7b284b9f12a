use crate::error::QueryError;
use crate::filter::{build_filter, VectorQuery};
use crate::models::{Citation, ConversationThread, NewMessage, RetrievalOptions, Role, Scope};
use crate::prompt::{build_context, build_prompt, citations, DocumentNames};
use crate::stream::{EventStream, StreamEvent};
use crate::traits::{ConversationStore, DocumentStore, Embedder, Generator, VectorIndex};
use async_stream::stream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    pub owner_id: String,
    pub question: String,
    pub scope: Scope,
    /// Honoured only when the thread exists and belongs to `owner_id`.
    pub thread_id: Option<String>,
}

enum Retrieval {
    /// Informational answer sent instead of a generated one.
    Fallback(String),
    Grounded {
        prompt: String,
        citations: Vec<Citation>,
    },
}

/// Answers questions over ready documents as a stream of [`StreamEvent`]s.
#[derive(Clone)]
pub struct AnswerStreamer {
    records: Arc<dyn DocumentStore>,
    conversations: Arc<dyn ConversationStore>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    options: RetrievalOptions,
}

impl AnswerStreamer {
    pub fn new(
        records: Arc<dyn DocumentStore>,
        conversations: Arc<dyn ConversationStore>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            records,
            conversations,
            embedder,
            vectors,
            generator,
            options,
        }
    }

    /// Validates the request, then returns the event stream. Nothing is
    /// persisted until the stream is polled; dropping it stops generation.
    pub fn ask(&self, request: AskRequest) -> Result<EventStream, QueryError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(QueryError::Validation("question is required".to_string()));
        }
        if request.owner_id.trim().is_empty() {
            return Err(QueryError::Validation("owner is required".to_string()));
        }

        let this = self.clone();
        let events = stream! {
            yield StreamEvent::Ready;

            let (thread, created) = match this.resolve_thread(&request).await {
                Ok(resolved) => resolved,
                Err(error) => {
                    warn!(owner_id = %request.owner_id, %error, "thread resolution failed");
                    yield StreamEvent::error(error);
                    return;
                }
            };
            if created {
                yield StreamEvent::Thread { thread_id: thread.id.clone() };
            }

            if let Err(error) = this.append(&thread, Role::User, question.clone(), Vec::new()).await {
                yield StreamEvent::error(error);
                return;
            }

            let (prompt, cited) = match this.retrieve(&question, &request.scope).await {
                Ok(Retrieval::Fallback(message)) => {
                    yield StreamEvent::token(message);
                    yield StreamEvent::Done;
                    return;
                }
                Ok(Retrieval::Grounded { prompt, citations }) => (prompt, citations),
                Err(error) => {
                    warn!(thread_id = %thread.id, %error, "retrieval failed");
                    yield StreamEvent::error(error);
                    return;
                }
            };

            let mut tokens = match this
                .generator
                .generate(&this.options.system_instruction, &prompt)
                .await
            {
                Ok(tokens) => tokens,
                Err(error) => {
                    yield StreamEvent::error(QueryError::Generation(error));
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(delta) => {
                        answer.push_str(&delta);
                        yield StreamEvent::token(delta);
                    }
                    Err(error) => {
                        warn!(thread_id = %thread.id, %error, "generation stream failed");
                        yield StreamEvent::error(QueryError::Generation(error));
                        return;
                    }
                }
            }

            if answer.is_empty() {
                answer = this.options.empty_answer_placeholder.clone();
            }
            if let Err(error) = this.append(&thread, Role::Assistant, answer, cited.clone()).await {
                yield StreamEvent::error(error);
                return;
            }

            info!(thread_id = %thread.id, citations = cited.len(), "answer streamed");
            yield StreamEvent::Citations { citations: cited };
            yield StreamEvent::Done;
        };

        let events: EventStream = Box::pin(events);
        Ok(events)
    }

    async fn resolve_thread(
        &self,
        request: &AskRequest,
    ) -> Result<(ConversationThread, bool), QueryError> {
        if let Some(thread_id) = &request.thread_id {
            match self.conversations.get_thread(thread_id).await? {
                Some(thread) if thread.owner_id == request.owner_id => return Ok((thread, false)),
                _ => debug!(thread_id = %thread_id, "pinned thread not usable, resolving by scope"),
            }
        }

        if let Some(thread) = self
            .conversations
            .latest_thread(&request.owner_id, &request.scope)
            .await?
        {
            return Ok((thread, false));
        }

        let thread = self
            .conversations
            .create_thread(&request.owner_id, &request.scope)
            .await?;
        Ok((thread, true))
    }

    async fn append(
        &self,
        thread: &ConversationThread,
        role: Role,
        content: String,
        citations: Vec<Citation>,
    ) -> Result<(), QueryError> {
        self.conversations
            .append_message(NewMessage {
                thread_id: thread.id.clone(),
                role,
                content,
                citations,
            })
            .await?;
        Ok(())
    }

    async fn retrieve(&self, question: &str, scope: &Scope) -> Result<Retrieval, QueryError> {
        let ready = self.records.find_ready(scope).await?;
        if ready.is_empty() {
            return Ok(Retrieval::Fallback(self.options.no_documents_message.clone()));
        }

        let names: DocumentNames = ready
            .iter()
            .map(|document| (document.id.clone(), document.filename.clone()))
            .collect();
        let eligible = ready.into_iter().map(|document| document.id).collect::<Vec<_>>();

        let vector = self
            .embedder
            .embed_batch(&[question.to_string()])
            .await
            .map_err(QueryError::Embedding)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                QueryError::Embedding(crate::error::BackendError::Request(
                    "no embedding returned for the question".to_string(),
                ))
            })?;

        let hits = self
            .vectors
            .search_points(&VectorQuery {
                vector,
                limit: self.options.top_k,
                filter: build_filter(&eligible, scope),
            })
            .await
            .map_err(QueryError::VectorStore)?;
        debug!(eligible = eligible.len(), hits = hits.len(), "similarity search finished");

        if hits.is_empty() {
            return Ok(Retrieval::Fallback(self.options.no_context_message.clone()));
        }

        let context = build_context(&hits, &names);
        Ok(Retrieval::Grounded {
            prompt: build_prompt(&context, question),
            citations: citations(&hits, &names),
        })
    }
}
