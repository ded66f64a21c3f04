//! OpenAI-compatible chat completions adapter.
//!
//! Also serves OpenRouter and custom endpoints. Tool names are sanitized to
//! `[A-Za-z0-9_-]{1,64}` with a per-request reverse map so restored names
//! reach the caller; a 400 response while tools are attached is retried once
//! without tools (some compatible servers reject the tools field outright).
//! `<think>` spans and `reasoning_content` deltas surface as reasoning chunks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::entity::SamplingConfig;
use crate::message::{ChatMessage, ContentPart, MessageContent, Role};
use crate::provider::sanitize::NameMap;
use crate::provider::sse::{data_payload, LineBuffer};
use crate::provider::think::{strip_think_tags, Piece, ThinkSplitter};
use crate::provider::{
    chunk_stream, ChatProvider, ChunkStream, ModelInfo, ProviderError, ProviderResponse,
    StreamChunk, TokenUsage, ToolCallRequest, ToolSchema, CHUNK_CHANNEL_CAPACITY,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible provider (OpenAI, OpenRouter, custom gateways).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model_id: String,
    sampling: SamplingConfig,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl OpenAiProvider {
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

    /// Chat completions URL; does not duplicate `/v1` when the base already
    /// ends with it (common for custom gateways).
    fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn models_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/models", base)
        } else {
            format!("{}/v1/models", base)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn content_to_wire(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Parts(parts) => Value::Array(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::ImageUrl { image_url } => {
                            json!({"type": "image_url", "image_url": {"url": image_url}})
                        }
                    })
                    .collect(),
            ),
        }
    }

    fn build_messages(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(sp) = system_prompt {
            out.push(json!({"role": "system", "content": sp}));
        }
        for m in messages {
            // Tool results travel as user messages; many compatible endpoints
            // reject role="tool".
            let role = match m.role {
                Role::Tool => "user",
                other => other.as_str(),
            };
            out.push(json!({"role": role, "content": Self::content_to_wire(&m.content)}));
        }
        out
    }

    fn build_payload(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
        stream: bool,
        names: &mut NameMap,
    ) -> Value {
        let mut payload = json!({
            "model": self.model_id,
            "messages": Self::build_messages(messages, system_prompt),
        });
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }
        if let Some(t) = self.sampling.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(mt) = self.sampling.max_tokens {
            payload["max_tokens"] = json!(mt);
        }
        if let Some(tp) = self.sampling.top_p {
            payload["top_p"] = json!(tp);
        }
        if let Some(stop) = &self.sampling.stop {
            payload["stop"] = json!(stop);
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": names.sanitize(&t.name),
                                "description": t.description,
                                "parameters": t.parameters,
                            }
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

    /// Sends the request; on 400 with tools attached, retries once without
    /// tools before giving up.
    async fn send_with_tool_fallback(
        &self,
        mut payload: Value,
        had_tools: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .authorize(self.client.post(self.chat_url()))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if response.status().as_u16() == 400 && had_tools {
            let body = response.text().await.unwrap_or_default();
            warn!(model = %self.model_id, error = %body, "400 with tools attached, retrying without tools");
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("tools");
            }
            let retry = self
                .authorize(self.client.post(self.chat_url()))
                .timeout(self.request_timeout)
                .json(&payload)
                .send()
                .await?;
            return Ok(retry);
        }
        Ok(response)
    }

    async fn run_stream(
        self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolSchema>,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let mut names = NameMap::new();
        let payload = self.build_payload(
            &messages,
            system_prompt.as_deref(),
            &tools,
            true,
            &mut names,
        );
        debug!(model = %self.model_id, url = %self.chat_url(), tools = tools.len(), "openai stream request");

        let response = self
            .send_with_tool_fallback(payload, !tools.is_empty())
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut splitter = ThinkSplitter::new();
        // index → (id, name, arguments) accumulated across deltas.
        let mut tool_acc: BTreeMap<u64, (String, String, String)> = BTreeMap::new();
        let mut usage: Option<TokenUsage> = None;

        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Http(e.to_string()))?;
            for line in lines.push(&bytes) {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    if let Some(piece) = splitter.finish() {
                        send_piece(&tx, piece).await;
                    }
                    for (idx, (id, name, arguments)) in std::mem::take(&mut tool_acc) {
                        let id = if id.is_empty() {
                            format!("call_{}", idx)
                        } else {
                            id
                        };
                        let _ = tx
                            .send(StreamChunk::ToolCall(ToolCallRequest {
                                id,
                                name: names.restore(&name).to_string(),
                                arguments,
                            }))
                            .await;
                    }
                    let _ = tx.send(StreamChunk::Done(usage)).await;
                    return Ok(());
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(u) = parsed.get("usage").filter(|u| !u.is_null()) {
                    usage = Some(TokenUsage {
                        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
                    });
                }
                let Some(delta) = parsed
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                else {
                    continue;
                };
                // DeepSeek-style native reasoning deltas.
                if let Some(r) = delta.get("reasoning_content").and_then(Value::as_str) {
                    if !r.is_empty() {
                        let _ = tx.send(StreamChunk::Reasoning(r.to_string())).await;
                    }
                }
                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        for piece in splitter.push(text) {
                            send_piece(&tx, piece).await;
                        }
                    }
                }
                if let Some(tool_deltas) = delta.get("tool_calls").and_then(Value::as_array) {
                    for td in tool_deltas {
                        let idx = td.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let entry = tool_acc.entry(idx).or_default();
                        if let Some(id) = td.get("id").and_then(Value::as_str) {
                            if !id.is_empty() {
                                entry.0 = id.to_string();
                            }
                        }
                        if let Some(f) = td.get("function") {
                            if let Some(name) = f.get("name").and_then(Value::as_str) {
                                entry.1.push_str(name);
                            }
                            if let Some(args) = f.get("arguments").and_then(Value::as_str) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }

        // Stream ended without [DONE]; flush what we have.
        if let Some(piece) = splitter.finish() {
            send_piece(&tx, piece).await;
        }
        for (idx, (id, name, arguments)) in tool_acc {
            let id = if id.is_empty() {
                format!("call_{}", idx)
            } else {
                id
            };
            let _ = tx
                .send(StreamChunk::ToolCall(ToolCallRequest {
                    id,
                    name: names.restore(&name).to_string(),
                    arguments,
                }))
                .await;
        }
        let _ = tx.send(StreamChunk::Done(usage)).await;
        Ok(())
    }
}

async fn send_piece(tx: &mpsc::Sender<StreamChunk>, piece: Piece) {
    let chunk = match piece {
        Piece::Content(t) => StreamChunk::Content(t),
        Piece::Reasoning(t) => StreamChunk::Reasoning(t),
    };
    let _ = tx.send(chunk).await;
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        let mut names = NameMap::new();
        let payload = self.build_payload(messages, system_prompt, tools, false, &mut names);
        debug!(model = %self.model_id, url = %self.chat_url(), tools = tools.len(), "openai chat request");

        let response = self
            .send_with_tool_fallback(payload, !tools.is_empty())
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let message = data
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::Decode("no choices in response".into()))?;

        let raw_content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (content, _) = strip_think_tags(raw_content);

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|tc| ToolCallRequest {
                        id: tc
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: names
                            .restore(tc.pointer("/function/name").and_then(Value::as_str).unwrap_or(""))
                            .to_string(),
                        arguments: tc
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = data.get("usage").filter(|u| !u.is_null()).map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
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

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .authorize(self.client.get(self.models_url()))
            .timeout(self.health_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let models = data
            .get("data")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(|id| ModelInfo {
                        id: id.to_string(),
                        name: id.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn test_connection(&self) -> bool {
        matches!(self.list_models().await, Ok(models) if !models.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(
            Some("test-key".into()),
            None,
            "gpt-4o",
            SamplingConfig::default(),
        )
    }

    /// **Scenario**: /v1 is appended once, never duplicated.
    #[test]
    fn chat_url_handles_v1_suffix() {
        let p = provider();
        assert_eq!(p.chat_url(), "https://api.openai.com/v1/chat/completions");

        let p = OpenAiProvider::new(
            None,
            Some("https://gw.example.com/v1/".into()),
            "m",
            SamplingConfig::default(),
        );
        assert_eq!(p.chat_url(), "https://gw.example.com/v1/chat/completions");
        assert_eq!(p.models_url(), "https://gw.example.com/v1/models");
    }

    /// **Scenario**: tool role is down-converted to user on the wire.
    #[test]
    fn tool_role_becomes_user() {
        let msgs = vec![ChatMessage {
            role: Role::Tool,
            content: MessageContent::Text("result".into()),
        }];
        let wire = OpenAiProvider::build_messages(&msgs, Some("sys"));
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"], "result");
    }

    /// **Scenario**: payload carries sampling knobs and sanitized tool names.
    #[test]
    fn payload_includes_sampling_and_tools() {
        let p = OpenAiProvider::new(
            None,
            None,
            "gpt-4o",
            SamplingConfig {
                temperature: Some(0.2),
                max_tokens: Some(512),
                ..Default::default()
            },
        );
        let tools = vec![ToolSchema {
            name: "weather.lookup".into(),
            description: "weather".into(),
            parameters: json!({"type": "object"}),
        }];
        let mut names = NameMap::new();
        let payload = p.build_payload(&[ChatMessage::user("hi")], None, &tools, true, &mut names);
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["max_tokens"], 512);
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["stream_options"]["include_usage"], true);
        assert_eq!(payload["tools"][0]["function"]["name"], "weather_lookup");
        assert_eq!(names.restore("weather_lookup"), "weather.lookup");
    }

    /// **Scenario**: multimodal parts serialize to the OpenAI parts form.
    #[test]
    fn multimodal_parts_wire_shape() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "look".into() },
            ContentPart::ImageUrl {
                image_url: "data:image/png;base64,QUJD".into(),
            },
        ]);
        let v = OpenAiProvider::content_to_wire(&content);
        assert_eq!(v[0]["type"], "text");
        assert_eq!(v[1]["type"], "image_url");
        assert_eq!(v[1]["image_url"]["url"], "data:image/png;base64,QUJD");
    }

    /// **Scenario**: streaming against an unreachable endpoint yields a single
    /// error chunk rather than a panic or hang.
    #[tokio::test]
    async fn stream_against_unreachable_endpoint_yields_error_chunk() {
        use futures::StreamExt;
        let p = OpenAiProvider::new(
            Some("k".into()),
            Some("http://127.0.0.1:1".into()),
            "gpt-4o",
            SamplingConfig::default(),
        );
        let mut stream = p.stream_chat(&[ChatMessage::user("hi")], None, &[]).await;
        match stream.next().await {
            Some(StreamChunk::Error(_)) => {}
            other => panic!("expected error chunk, got {:?}", other),
        }
    }
}
