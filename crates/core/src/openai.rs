use crate::embeddings::check_batch;
use crate::error::BackendError;
use crate::traits::{Embedder, Generator, TokenStream};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

const BACKEND: &str = "openai";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chat_model: String,
    pub connect_timeout: Duration,
    /// Deadline for a whole embeddings call.
    pub request_timeout: Duration,
    /// Longest silence tolerated between reads; streamed completions have no overall deadline.
    pub read_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1_536,
            chat_model: "gpt-4o-mini".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Embeddings and streamed chat completions against an OpenAI-compatible API.
pub struct OpenAiClient {
    base_url: String,
    config: OpenAiConfig,
    client: Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CompletionLine {
    Delta(String),
    Done,
    Skip,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let base_url = Url::parse(&config.base_url)?
            .as_str()
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        Ok(Self {
            base_url,
            config,
            client,
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(&self.config.api_key)
    }
}

async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    })
}

fn order_embeddings(mut items: Vec<EmbeddingItem>) -> Vec<Vec<f32>> {
    items.sort_by_key(|item| item.index);
    items.into_iter().map(|item| item.embedding).collect()
}

/// Interprets one line of a streamed chat completion body.
pub(crate) fn parse_completion_line(line: &str) -> Result<CompletionLine, BackendError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(CompletionLine::Skip);
    };

    let data = data.trim();
    if data == "[DONE]" {
        return Ok(CompletionLine::Done);
    }

    let parsed: Value = serde_json::from_str(data)?;
    if let Some(message) = parsed.pointer("/error/message").and_then(Value::as_str) {
        return Err(BackendError::BackendResponse {
            backend: BACKEND.to_string(),
            details: message.to_string(),
        });
    }

    Ok(parsed
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|delta| !delta.is_empty())
        .map(|delta| CompletionLine::Delta(delta.to_string()))
        .unwrap_or(CompletionLine::Skip))
}

#[async_trait]
impl Embedder for OpenAiClient {
    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .post("embeddings")
            .timeout(self.config.request_timeout)
            .json(&EmbeddingRequest {
                model: &self.config.embedding_model,
                input: texts,
            })
            .send()
            .await?;

        let parsed: EmbeddingResponse = ensure_success(response).await?.json().await?;
        let vectors = order_embeddings(parsed.data);
        check_batch(texts.len(), &vectors, self.config.embedding_dimensions)?;

        debug!(count = vectors.len(), model = %self.config.embedding_model, "embedded batch");
        Ok(vectors)
    }
}

#[async_trait]
impl Generator for OpenAiClient {
    async fn generate(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<TokenStream, BackendError> {
        let response = self
            .post("chat/completions")
            .json(&ChatRequest {
                model: &self.config.chat_model,
                stream: true,
                messages: [
                    ChatMessage {
                        role: "system",
                        content: system_instruction,
                    },
                    ChatMessage {
                        role: "user",
                        content: prompt,
                    },
                ],
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let stream = stream! {
            let mut body = response.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();

            'read: while let Some(bytes) = body.next().await {
                let bytes = match bytes {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(BackendError::from(error));
                        break 'read;
                    }
                };
                pending.extend_from_slice(&bytes);

                while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
                    let line = pending.drain(..=newline).collect::<Vec<u8>>();
                    match parse_completion_line(String::from_utf8_lossy(&line).trim()) {
                        Ok(CompletionLine::Delta(delta)) => yield Ok(delta),
                        Ok(CompletionLine::Done) => break 'read,
                        Ok(CompletionLine::Skip) => {}
                        Err(error) => {
                            yield Err(error);
                            break 'read;
                        }
                    }
                }
            }
        };

        let tokens: TokenStream = Box::pin(stream);
        Ok(tokens)
    }
}
