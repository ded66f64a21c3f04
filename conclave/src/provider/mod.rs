//! Uniform capability over heterogeneous LLM wire protocols.
//!
//! Four adapters implement [`ChatProvider`]: [`OpenAiProvider`]
//! (OpenAI-compatible, also OpenRouter and custom endpoints),
//! [`AnthropicProvider`], [`GeminiProvider`], and [`OllamaProvider`].
//! All normalize to the same contract:
//!
//! - Multimodal content is plain text or an ordered list of text /
//!   data-URI-image parts ([`crate::message::MessageContent`]).
//! - Tool schemas are presented in OpenAI function form ([`ToolSchema`]);
//!   adapters translate outbound and reverse-translate inbound calls.
//! - Usage is normalized to `{input_tokens, output_tokens}` ([`TokenUsage`]).
//! - `<think>…</think>` spans inside content streams become [`StreamChunk::Reasoning`]
//!   chunks; partial tags crossing chunk boundaries are buffered ([`think::ThinkSplitter`]).
//!
//! Streaming returns a pull sequence of tagged chunks. Upstream HTTP failures
//! surface as one [`StreamChunk::Error`] that terminates the stream; the
//! request itself never fails to start.

pub mod anthropic;
pub mod factory;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod sanitize;
pub mod sse;
pub mod think;

pub use anthropic::AnthropicProvider;
pub use factory::{build_provider, build_provider_with_timeouts};
pub use gemini::GeminiProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::ChatMessage;

/// Normalized token usage for one LLM call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON string, exactly as produced by the model.
    pub arguments: String,
}

impl ToolCallRequest {
    /// Arguments parsed to a JSON value; malformed JSON yields `{}`.
    pub fn arguments_value(&self) -> Value {
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// One chunk of a streaming response.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    Content(String),
    Reasoning(String),
    ToolCall(ToolCallRequest),
    Done(Option<TokenUsage>),
    Error(String),
}

/// Complete (non-streaming) response.
#[derive(Clone, Debug, Default)]
pub struct ProviderResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

/// A tool schema in OpenAI function form:
/// `{"type": "function", "function": {"name", "description", "parameters"}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolSchema {
    /// Renders the OpenAI wire form.
    pub fn to_openai(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One model listed by a provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Errors raised before a stream starts (request build, non-streaming calls).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http: {0}")]
    Http(String),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

/// Pull sequence of stream chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Wraps a bounded channel receiver as a [`ChunkStream`].
pub(crate) fn chunk_stream(rx: mpsc::Receiver<StreamChunk>) -> ChunkStream {
    Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Capacity of adapter chunk channels.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Uniform interface over provider wire protocols.
///
/// `stream_chat` always returns a stream: pre-request failures become one
/// [`StreamChunk::Error`] item. `chat` is the blocking variant used for
/// compaction summaries, condition classification, memory reflection, and
/// inner workflow nodes.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Model id requests are issued against.
    fn model_id(&self) -> &str;

    /// Blocking chat completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError>;

    /// Streaming chat completion.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> ChunkStream;

    /// Models available from this provider.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// True when the provider is reachable and credentials work.
    async fn test_connection(&self) -> bool;
}

/// Collects a full [`ProviderResponse`] by draining a stream. Shared by
/// adapters whose blocking path is implemented over the streaming one, and by
/// tests.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<ProviderResponse, ProviderError> {
    use futures::StreamExt;

    let mut resp = ProviderResponse::default();
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Content(text) => resp.content.push_str(&text),
            StreamChunk::Reasoning(_) => {}
            StreamChunk::ToolCall(tc) => resp.tool_calls.push(tc),
            StreamChunk::Done(usage) => {
                resp.usage = usage;
                break;
            }
            StreamChunk::Error(message) => {
                return Err(ProviderError::Http(message));
            }
        }
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: malformed tool-call arguments degrade to an empty object.
    #[test]
    fn arguments_value_tolerates_bad_json() {
        let tc = ToolCallRequest {
            id: "call_1".into(),
            name: "t".into(),
            arguments: "{not json".into(),
        };
        assert_eq!(tc.arguments_value(), serde_json::json!({}));

        let ok = ToolCallRequest {
            id: "call_2".into(),
            name: "t".into(),
            arguments: r#"{"x": 1}"#.into(),
        };
        assert_eq!(ok.arguments_value()["x"], 1);
    }

    /// **Scenario**: the OpenAI wire form nests name/description/parameters
    /// under "function".
    #[test]
    fn tool_schema_openai_form() {
        let schema = ToolSchema {
            name: "send_email".into(),
            description: "Send an email".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let v = schema.to_openai();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "send_email");
        assert_eq!(v["function"]["parameters"]["type"], "object");
    }

    /// **Scenario**: collect_stream accumulates content and stops at done.
    #[tokio::test]
    async fn collect_stream_accumulates() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::Content("a".into())).await.unwrap();
        tx.send(StreamChunk::Content("b".into())).await.unwrap();
        tx.send(StreamChunk::Done(Some(TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
        })))
        .await
        .unwrap();
        drop(tx);

        let resp = collect_stream(chunk_stream(rx)).await.unwrap();
        assert_eq!(resp.content, "ab");
        assert_eq!(resp.usage.unwrap().output_tokens, 2);
    }

    /// **Scenario**: an error chunk converts to Err.
    #[tokio::test]
    async fn collect_stream_propagates_error() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::Error("boom".into())).await.unwrap();
        drop(tx);
        let err = collect_stream(chunk_stream(rx)).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
