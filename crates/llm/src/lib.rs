use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

mod http;
pub use http::HttpLlmClient;

// ── Chat message types for structured tool calling ───────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (only present on assistant messages).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_turn(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this call (used to correlate tool results).  Some
    /// endpoints omit it, in which case we generate one.
    #[serde(default)]
    pub id: String,
    /// Always "function" for OpenAI-compatible APIs.
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a parsed JSON object (normalized from the wire format,
    /// which sends them as a string).
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Static description of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Build the OpenAI-compatible `tools` array from tool definitions.
pub fn definitions_to_openai_tools(defs: &[ToolDefinition]) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = defs
        .iter()
        .map(|d| {
            json!({
                "type": "function",
                "function": {
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                }
            })
        })
        .collect();
    json!(tools)
}

/// Generation parameters forwarded to the inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    /// Sampling seed; evaluation derives one per attempt for reproducibility.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

/// One outgoing chat request.  The client is stateless; the full conversation
/// travels with every request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub tools: Vec<ToolDefinition>,
    pub max_context_tokens: usize,
}

/// Incremental fragment of a tool call as it arrives on the stream.
///
/// The name is sent once in the first fragment for an index; the argument
/// string arrives in pieces and is concatenated before parsing.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One chunk of a streaming chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub delta_content: Option<String>,
    pub delta_tool_calls: Vec<ToolCallDelta>,
    pub is_final: bool,
    pub finish_reason: Option<String>,
    /// Completion token count, when the endpoint reports usage on the final chunk.
    pub tokens_generated: Option<u64>,
}

/// Aggregated result of a chat exchange.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Text content of the assistant's response (may be empty if tool_calls present).
    pub content: String,
    /// Tool calls the assistant wants to make (empty if a normal text response).
    pub tool_calls: Vec<ToolCall>,
    /// Finish reason: "stop", "tool_calls", "length", etc.
    pub finish_reason: String,
    pub tokens_generated: u64,
}

/// Errors surfaced by a chat endpoint.  Transport failures are not retried
/// here; the caller decides what an aborted exchange means.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed stream: {0}")]
    MalformedStream(String),
    #[error("endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
}

/// A finite, single-pass sequence of chat chunks.  Not restartable; callers
/// buffer if they need to revisit earlier chunks.
pub type ChunkStream = mpsc::Receiver<Result<ChatChunk, LlmError>>;

/// The seam between conversation logic and the inference endpoint.
///
/// Production uses [`HttpLlmClient`]; tests script responses directly.
#[async_trait]
pub trait ChatEndpoint: Send + Sync {
    /// Open a streaming chat exchange.  The returned stream yields chunks
    /// until a final chunk (or an error) and then closes.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, LlmError>;

    /// Drain a streaming exchange into an aggregated response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut rx = self.chat_stream(request).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk?);
        }
        Ok(fold_chunks(&chunks))
    }
}

/// Fold a sequence of chunks into one [`ChatResponse`].
///
/// Tool call fragments are accumulated by stream index: the id and name are
/// assigned from the first fragment that carries them, argument fragments are
/// appended in order, and the accumulated argument string is parsed as JSON
/// once the stream is complete.
pub fn fold_chunks(chunks: &[ChatChunk]) -> ChatResponse {
    let mut content = String::new();
    let mut finish_reason = "stop".to_string();
    let mut tokens_generated = 0u64;
    // index → (id, name, arguments)
    let mut calls: BTreeMap<usize, (String, String, String)> = BTreeMap::new();

    for chunk in chunks {
        if let Some(ref delta) = chunk.delta_content {
            content.push_str(delta);
        }
        for delta in &chunk.delta_tool_calls {
            let entry = calls.entry(delta.index).or_default();
            if let Some(ref id) = delta.id {
                entry.0 = id.clone();
            }
            if let Some(ref name) = delta.name {
                entry.1 = name.clone();
            }
            if let Some(ref args) = delta.arguments {
                entry.2.push_str(args);
            }
        }
        if let Some(ref reason) = chunk.finish_reason {
            finish_reason = reason.clone();
        }
        if let Some(tokens) = chunk.tokens_generated {
            tokens_generated = tokens;
        }
    }

    let tool_calls: Vec<ToolCall> = calls
        .into_iter()
        .map(|(index, (id, name, args_str))| {
            let arguments = serde_json::from_str(&args_str).unwrap_or_else(|_| json!({}));
            ToolCall {
                id: if id.is_empty() { format!("call_{index}") } else { id },
                r#type: "function".to_string(),
                function: ToolCallFunction { name, arguments },
            }
        })
        .collect();

    if !tool_calls.is_empty() && finish_reason == "stop" {
        finish_reason = "tool_calls".to_string();
    }

    ChatResponse {
        content,
        tool_calls,
        finish_reason,
        tokens_generated,
    }
}

/// Convert a `ChatMessage` array to the OpenAI-compatible wire format.
pub(crate) fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages.iter().map(|m| {
        let role = match m.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        let mut msg = json!({ "role": role });
        match m.content {
            Some(ref content) => msg["content"] = json!(content),
            None => msg["content"] = json!(null),
        }
        if !m.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = m.tool_calls.iter().map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.function.name,
                        // The wire format wants arguments as a JSON string.
                        "arguments": tc.function.arguments.to_string(),
                    }
                })
            }).collect();
            msg["tool_calls"] = json!(calls);
        }
        if let Some(ref id) = m.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        msg
    }).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
