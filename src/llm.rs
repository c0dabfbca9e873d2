//! Language model providers.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};

use crate::{
    error::{Error, Result},
    http::ApiClient,
    usage::Usage,
};

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Low temperature keeps answers close to the supplied context.
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

const STREAM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Receiver of text deltas plus the task resolving to the full generation.
pub type TokenStream = (mpsc::Receiver<String>, TaskGuard<Result<Generation>>);

/// A spawned task that is aborted when its guard is dropped.
///
/// Awaiting the guard yields the task's output like a [`JoinHandle`].
#[derive(Debug)]
pub struct TaskGuard<T>(JoinHandle<T>);

impl<T> TaskGuard<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for TaskGuard<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation>;

    /// Stream text deltas as they arrive.
    ///
    /// The default runs [`LlmProvider::generate`] and emits the whole text
    /// as a single delta.
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<TokenStream> {
        let generation = self.generate(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let _ = tx.send(generation.text.clone()).await;
            Ok(generation)
        });
        Ok((rx, TaskGuard::new(handle)))
    }
}

/// OpenAI `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: ApiClient,
}

impl OpenAiChat {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> ChatRequest<'a> {
    fn new(request: &'a GenerateRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let response: ChatResponse = self
            .client
            .post_json("chat/completions", &ChatRequest::new(request, false))
            .await?;
        let text = response
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| Error::Provider {
                provider: self.client.provider(),
                message: "response contained no message".to_string(),
            })?;
        Ok(Generation {
            text,
            usage: response.usage.unwrap_or_default(),
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<TokenStream> {
        let resp = self
            .client
            .post_stream("chat/completions", &ChatRequest::new(request, true))
            .await?;
        let provider = self.client.provider();
        let (tx, rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut generation = Generation::default();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk) {
                    let data = match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Data(data) => data,
                    };
                    let parsed = serde_json::from_str::<ChatChunk>(&data);
                    let parsed = match parsed {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::debug!(
                                error = %e,
                                "skipping malformed stream event"
                            );
                            continue;
                        }
                    };
                    if let Some(usage) = parsed.usage {
                        generation.usage = usage;
                    }
                    let deltas = parsed
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content);
                    for delta in deltas {
                        if delta.is_empty() {
                            continue;
                        }
                        generation.text.push_str(&delta);
                        // A dropped receiver only stops the echo, not the
                        // accumulation.
                        let _ = tx.send(delta).await;
                    }
                }
            }

            if generation.text.is_empty() {
                return Err(Error::Provider {
                    provider,
                    message: "stream ended without content".to_string(),
                });
            }
            Ok(generation)
        });

        Ok((rx, TaskGuard::new(handle)))
    }
}

/// A server-sent event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
///
/// Bytes are buffered until a full line arrives, so a character split
/// across network chunks decodes intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n')
        {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
        }
        events
    }
}
