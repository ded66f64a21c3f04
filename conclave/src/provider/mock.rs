//! Scripted provider for tests and offline development.
//!
//! Feed either full [`ProviderResponse`] turns or raw chunk scripts; each
//! chat/stream call consumes the next entry. An exhausted mock returns empty
//! responses, which ends any tool loop.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::ChatMessage;
use crate::provider::{
    chunk_stream, ChatProvider, ChunkStream, ModelInfo, ProviderError, ProviderResponse,
    StreamChunk, TokenUsage, ToolCallRequest, ToolSchema, CHUNK_CHANNEL_CAPACITY,
};

enum Turn {
    Response(ProviderResponse),
    Script(Vec<StreamChunk>),
}

/// Scripted [`ChatProvider`].
pub struct MockProvider {
    model_id: String,
    turns: Mutex<VecDeque<Turn>>,
    /// Messages seen by the most recent call, for assertions.
    pub last_messages: Mutex<Vec<ChatMessage>>,
    /// Tool schemas seen by the most recent call, for assertions.
    pub last_tools: Mutex<Vec<ToolSchema>>,
}

impl MockProvider {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            turns: Mutex::new(VecDeque::new()),
            last_messages: Mutex::new(Vec::new()),
            last_tools: Mutex::new(Vec::new()),
        }
    }

    /// One plain text reply.
    pub fn with_text(model_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mock = Self::new(model_id);
        mock.push_text(content);
        mock
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.push_response(ProviderResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        });
    }

    pub fn push_tool_call(&self, id: &str, name: &str, arguments: &str) {
        self.push_response(ProviderResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            }],
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        });
    }

    pub fn push_response(&self, response: ProviderResponse) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(Turn::Response(response));
        }
    }

    /// Raw chunk script for one streaming call (boundary-case tests).
    pub fn push_script(&self, chunks: Vec<StreamChunk>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(Turn::Script(chunks));
        }
    }

    fn next_turn(&self) -> Turn {
        self.turns
            .lock()
            .ok()
            .and_then(|mut t| t.pop_front())
            .unwrap_or(Turn::Response(ProviderResponse::default()))
    }

    fn record(&self, messages: &[ChatMessage], tools: &[ToolSchema]) {
        if let Ok(mut m) = self.last_messages.lock() {
            *m = messages.to_vec();
        }
        if let Ok(mut t) = self.last_tools.lock() {
            *t = tools.to_vec();
        }
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        self.record(messages, tools);
        match self.next_turn() {
            Turn::Response(r) => Ok(r),
            Turn::Script(chunks) => {
                let mut resp = ProviderResponse::default();
                for chunk in chunks {
                    match chunk {
                        StreamChunk::Content(t) => resp.content.push_str(&t),
                        StreamChunk::Reasoning(_) => {}
                        StreamChunk::ToolCall(tc) => resp.tool_calls.push(tc),
                        StreamChunk::Done(u) => resp.usage = u,
                        StreamChunk::Error(e) => return Err(ProviderError::Http(e)),
                    }
                }
                Ok(resp)
            }
        }
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        _system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> ChunkStream {
        self.record(messages, tools);
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let chunks = match self.next_turn() {
            Turn::Script(chunks) => chunks,
            Turn::Response(r) => {
                let mut chunks = Vec::new();
                if !r.content.is_empty() {
                    chunks.push(StreamChunk::Content(r.content));
                }
                chunks.extend(r.tool_calls.into_iter().map(StreamChunk::ToolCall));
                chunks.push(StreamChunk::Done(r.usage));
                chunks
            }
        };
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        chunk_stream(rx)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo {
            id: self.model_id.clone(),
            name: self.model_id.clone(),
        }])
    }

    async fn test_connection(&self) -> bool {
        true
    }
}
