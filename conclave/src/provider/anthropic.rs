//! Anthropic Messages API adapter.
//!
//! Anthropic requires alternating user/assistant roles, so consecutive
//! same-role messages are merged (text joined with a blank line, structured
//! parts concatenated as block lists) and `tool` role is down-converted to
//! `user`. The system prompt is wrapped as a structured block with an
//! ephemeral cache-control marker.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::entity::SamplingConfig;
use crate::message::{ChatMessage, ContentPart, MessageContent, Role};
use crate::provider::sse::{data_payload, LineBuffer};
use crate::provider::{
    chunk_stream, ChatProvider, ChunkStream, ModelInfo, ProviderError, ProviderResponse,
    StreamChunk, TokenUsage, ToolCallRequest, ToolSchema, CHUNK_CHANNEL_CAPACITY,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const CACHING_BETA: &str = "prompt-caching-2024-07-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude provider.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model_id: String,
    sampling: SamplingConfig,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        model_id: impl Into<String>,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model_id: model_id.into(),
            sampling,
            request_timeout: Duration::from_secs(120),
            health_timeout: Duration::from_secs(15),
        }
    }


    pub fn with_timeouts(mut self, request: Duration, health: Duration) -> Self {
        self.request_timeout = request;
        self.health_timeout = health;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", CACHING_BETA);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }

    /// Converts message content to the Anthropic content value: a bare string
    /// for text, or a block list for multimodal parts.
    fn content_to_wire(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Parts(parts) => {
                let blocks: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                        ContentPart::ImageUrl { image_url } => {
                            let (media_type, data) = split_data_uri(image_url)?;
                            Some(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data,
                                }
                            }))
                        }
                    })
                    .collect();
                Value::Array(blocks)
            }
        }
    }

    /// Merges two wire content values for consecutive same-role messages.
    fn merge_content(prev: Value, new: Value) -> Value {
        match (prev, new) {
            (Value::String(a), Value::String(b)) => Value::String(format!("{}\n\n{}", a, b)),
            (prev, new) => {
                let mut blocks = match prev {
                    Value::String(s) => vec![json!({"type": "text", "text": s})],
                    Value::Array(a) => a,
                    other => vec![other],
                };
                match new {
                    Value::String(s) => blocks.push(json!({"type": "text", "text": s})),
                    Value::Array(mut a) => blocks.append(&mut a),
                    other => blocks.push(other),
                }
                Value::Array(blocks)
            }
        }
    }

    /// Builds the alternating-role message list: tool → user, consecutive
    /// same-role merged, empty content dropped.
    fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut out: Vec<Value> = Vec::new();
        for m in messages {
            let role = match m.role {
                Role::Tool => "user",
                Role::System => "user",
                other => other.as_str(),
            };
            let content = Self::content_to_wire(&m.content);
            let empty = match &content {
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => true,
            };
            if empty {
                continue;
            }
            if let Some(last) = out.last_mut() {
                if last["role"] == role {
                    let prev = last["content"].take();
                    last["content"] = Self::merge_content(prev, content);
                    continue;
                }
            }
            out.push(json!({"role": role, "content": content}));
        }
        out
    }

    fn build_payload(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": self.model_id,
            "messages": Self::build_messages(messages),
            "max_tokens": self.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if stream {
            payload["stream"] = json!(true);
        }
        if let Some(sp) = system_prompt {
            // Structured system block with an ephemeral cache-control marker.
            payload["system"] = json!([
                {"type": "text", "text": sp, "cache_control": {"type": "ephemeral"}}
            ]);
        }
        if let Some(t) = self.sampling.temperature {
            payload["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        payload
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.get("detail"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(body);
        ProviderError::Api { status, message }
    }

    async fn run_stream(
        self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolSchema>,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let payload = self.build_payload(&messages, system_prompt.as_deref(), &tools, true);
        debug!(model = %self.model_id, tools = tools.len(), "anthropic stream request");

        let response = self
            .request(self.messages_url())
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut block_type = String::new();
        let mut tool_id = String::new();
        let mut tool_name = String::new();
        let mut tool_args = String::new();
        let mut input_tokens: u32 = 0;

        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Http(e.to_string()))?;
            for line in lines.push(&bytes) {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                match event.get("type").and_then(Value::as_str).unwrap_or("") {
                    "message_start" => {
                        input_tokens = event
                            .pointer("/message/usage/input_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32;
                    }
                    "content_block_start" => {
                        let block = event.get("content_block").cloned().unwrap_or_default();
                        block_type = block
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        if block_type == "tool_use" {
                            tool_id = block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            tool_name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            tool_args.clear();
                        }
                    }
                    "content_block_delta" => {
                        let delta = event.get("delta").cloned().unwrap_or_default();
                        match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                            "text_delta" => {
                                if let Some(t) = delta.get("text").and_then(Value::as_str) {
                                    let _ = tx.send(StreamChunk::Content(t.to_string())).await;
                                }
                            }
                            "thinking_delta" => {
                                if let Some(t) = delta.get("thinking").and_then(Value::as_str) {
                                    let _ = tx.send(StreamChunk::Reasoning(t.to_string())).await;
                                }
                            }
                            "input_json_delta" => {
                                if let Some(t) = delta.get("partial_json").and_then(Value::as_str) {
                                    tool_args.push_str(t);
                                }
                            }
                            _ => {}
                        }
                    }
                    "content_block_stop" => {
                        if block_type == "tool_use" {
                            let _ = tx
                                .send(StreamChunk::ToolCall(ToolCallRequest {
                                    id: std::mem::take(&mut tool_id),
                                    name: std::mem::take(&mut tool_name),
                                    arguments: std::mem::take(&mut tool_args),
                                }))
                                .await;
                        }
                        block_type.clear();
                    }
                    "message_delta" => {
                        if let Some(u) = event.get("usage").filter(|u| !u.is_null()) {
                            let usage = TokenUsage {
                                input_tokens: u
                                    .get("input_tokens")
                                    .and_then(Value::as_u64)
                                    .unwrap_or(input_tokens as u64)
                                    as u32,
                                output_tokens: u
                                    .get("output_tokens")
                                    .and_then(Value::as_u64)
                                    .unwrap_or(0) as u32,
                            };
                            let _ = tx.send(StreamChunk::Done(Some(usage))).await;
                            return Ok(());
                        }
                    }
                    "message_stop" => {
                        let _ = tx.send(StreamChunk::Done(None)).await;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        let _ = tx.send(StreamChunk::Done(None)).await;
        Ok(())
    }
}

/// Splits a `data:<media>;base64,<payload>` URI into (media_type, payload).
fn split_data_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next().unwrap_or("").to_string();
    Some((media_type, data.to_string()))
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        let payload = self.build_payload(messages, system_prompt, tools, false);
        debug!(model = %self.model_id, tools = tools.len(), "anthropic chat request");

        let response = self
            .request(self.messages_url())
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let blocks = data
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let content: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        let tool_calls: Vec<ToolCallRequest> = blocks
            .iter()
            .filter(|b| b["type"] == "tool_use")
            .map(|b| ToolCallRequest {
                id: b.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                name: b
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                arguments: b
                    .get("input")
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            })
            .collect();

        let usage = data.get("usage").filter(|u| !u.is_null()).map(|u| TokenUsage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(ProviderResponse {
            content,
            tool_calls,
            usage,
        })
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let this = self.clone();
        let messages = messages.to_vec();
        let system_prompt = system_prompt.map(str::to_string);
        let tools = tools.to_vec();
        tokio::spawn(async move {
            let err_tx = tx.clone();
            if let Err(e) = this.run_stream(messages, system_prompt, tools, tx).await {
                let _ = err_tx.send(StreamChunk::Error(e.to_string())).await;
            }
        });
        chunk_stream(rx)
    }

    /// Anthropic has no public models-listing endpoint; a fixed set is
    /// returned.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok([
            ("claude-opus-4-6", "Claude Opus 4.6"),
            ("claude-sonnet-4-6", "Claude Sonnet 4.6"),
            ("claude-haiku-4-5-20251001", "Claude Haiku 4.5"),
            ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5"),
            ("claude-opus-4-5-20251101", "Claude Opus 4.5"),
            ("claude-opus-4-20250514", "Claude Opus 4"),
            ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
        ]
        .into_iter()
        .map(|(id, name)| ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
        })
        .collect())
    }

    async fn test_connection(&self) -> bool {
        let payload = json!({
            "model": self.model_id,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });
        let result = self
            .request(self.messages_url())
            .timeout(self.health_timeout)
            .json(&payload)
            .send()
            .await;
        matches!(result, Ok(r) if r.status().is_success())
    }
}
