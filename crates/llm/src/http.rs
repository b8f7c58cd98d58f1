//! OpenAI-compatible HTTP client for a streaming chat-with-tools endpoint.
//!
//! Speaks `POST {base_url}/chat/completions` with `stream: true` and parses
//! the SSE `data:` lines into [`ChatChunk`]s.  Transport and stream-shape
//! failures surface as a single [`LlmError`]; there is no retry here.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    definitions_to_openai_tools, messages_to_openai, ChatChunk, ChatEndpoint, ChatRequest,
    ChunkStream, LlmError, ToolCallDelta,
};

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Embed a batch of texts.  Non-streaming; peripheral to the chat path.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let payload = json!({ "model": self.model, "input": texts });
        let mut builder = self.client.post(self.endpoint("embeddings")).json(&payload);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Endpoint { status: status.as_u16(), body });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedStream(e.to_string()))?;
        let embeddings = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| LlmError::MalformedStream("embeddings response missing data".into()))?
            .iter()
            .map(|item| {
                item.get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|vals| {
                        vals.iter()
                            .filter_map(|v| v.as_f64())
                            .map(|v| v as f32)
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| {
                        LlmError::MalformedStream("embedding item missing vector".into())
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(embeddings)
    }
}

#[async_trait::async_trait]
impl ChatEndpoint for HttpLlmClient {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_openai(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
            "top_p": request.params.top_p,
            "top_k": request.params.top_k,
            "repetition_penalty": request.params.repetition_penalty,
        });
        if let Some(seed) = request.params.seed {
            payload["seed"] = json!(seed);
        }
        if !request.tools.is_empty() {
            payload["tools"] = definitions_to_openai_tools(&request.tools);
        }

        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            "opening chat stream"
        );

        let mut builder = self
            .client
            .post(self.endpoint("chat/completions"))
            .json(&payload);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Endpoint { status: status.as_u16(), body });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_sse(response, tx));
        Ok(rx)
    }
}

/// Read the response body, split out complete SSE lines (fragments may span
/// network chunks), and forward parsed [`ChatChunk`]s until `[DONE]`.
async fn pump_sse(mut response: reqwest::Response, tx: mpsc::Sender<Result<ChatChunk, LlmError>>) {
    let mut buffer = String::new();
    let mut saw_final = false;

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        if !saw_final {
                            let _ = tx
                                .send(Ok(ChatChunk {
                                    is_final: true,
                                    finish_reason: Some("stop".to_string()),
                                    ..Default::default()
                                }))
                                .await;
                        }
                        return;
                    }
                    match parse_sse_chunk(data) {
                        Ok(chunk) => {
                            if chunk.is_final {
                                saw_final = true;
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Receiver dropped mid-stream; stop pumping.
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                if !saw_final {
                    let _ = tx
                        .send(Err(LlmError::MalformedStream(
                            "stream ended without a final chunk".to_string(),
                        )))
                        .await;
                }
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(LlmError::Transport(e.to_string()))).await;
                return;
            }
        }
    }
}

/// Parse one SSE `data:` payload into a [`ChatChunk`].
fn parse_sse_chunk(data: &str) -> Result<ChatChunk, LlmError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| LlmError::MalformedStream(format!("unparseable chunk: {e}")))?;

    let mut chunk = ChatChunk::default();

    // Usage arrives on a trailing chunk with an empty choices array when
    // stream_options.include_usage is honoured.
    if let Some(usage) = value.get("usage") {
        chunk.tokens_generated = usage.get("completion_tokens").and_then(|v| v.as_u64());
    }

    let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
        return Ok(chunk);
    };

    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        chunk.finish_reason = Some(reason.to_string());
        chunk.is_final = true;
    }

    let Some(delta) = choice.get("delta") else {
        return Ok(chunk);
    };

    if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
        if !content.is_empty() {
            chunk.delta_content = Some(content.to_string());
        }
    }

    if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in calls {
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let mut fragment = ToolCallDelta { index, ..Default::default() };
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                fragment.id = Some(id.to_string());
            }
            if let Some(func) = tc.get("function") {
                if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                    fragment.name = Some(name.to_string());
                }
                if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                    fragment.arguments = Some(args.to_string());
                }
            }
            chunk.delta_tool_calls.push(fragment);
        }
    }

    Ok(chunk)
}
