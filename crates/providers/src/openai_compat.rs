//! OpenAI-compatible streaming transport.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp server, KoboldCpp,
//! and any endpoint exposing `/completions` or `/chat/completions`.
//!
//! Supports:
//! - Text completions for packed text prompts, chat completions for turns
//! - Multiple candidates (`n`), surfaced as swipes
//! - Tool call and `reasoning_content` deltas
//! - Cancellation between SSE events

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chatweave_config::BackendConfig;
use chatweave_core::error::TransportError;
use chatweave_core::message::{Role, ToolInvocation};
use chatweave_core::transport::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Most OpenAI-compatible backends reject more than four stop sequences.
pub const MAX_STOP_STRINGS: usize = 4;

/// An OpenAI-compatible streaming backend.
pub struct OpenAiCompatTransport {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatTransport {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, TransportError> {
        Self::new("openai-compat", &config.api_url, config.api_key.clone())
    }

    fn endpoint(&self, prompt: &PromptPayload) -> String {
        match prompt {
            PromptPayload::Text(_) => format!("{}/completions", self.base_url),
            PromptPayload::Chat(_) => format!("{}/chat/completions", self.base_url),
        }
    }

    fn to_api_messages(turns: &[ChatTurn]) -> Vec<ApiMessage> {
        turns
            .iter()
            .map(|t| ApiMessage {
                role: match t.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System | Role::Narrator => "system".into(),
                },
                content: t.content.clone(),
                name: t.name.clone(),
            })
            .collect()
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut body = match &request.prompt {
            PromptPayload::Text(prompt) => serde_json::json!({
                "model": request.model,
                "prompt": prompt,
            }),
            PromptPayload::Chat(turns) => serde_json::json!({
                "model": request.model,
                "messages": Self::to_api_messages(turns),
            }),
        };

        body["temperature"] = serde_json::json!(request.temperature);
        body["stream"] = serde_json::json!(true);

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.stop.is_empty() {
            if request.stop.len() > MAX_STOP_STRINGS {
                debug!(
                    requested = request.stop.len(),
                    sent = MAX_STOP_STRINGS,
                    "Truncating stop strings; the rest are applied locally"
                );
            }
            let sent = request.stop.len().min(MAX_STOP_STRINGS);
            body["stop"] = serde_json::json!(&request.stop[..sent]);
        }

        if request.candidates > 1 {
            body["n"] = serde_json::json!(request.candidates);
        }

        body
    }
}

#[async_trait]
impl Transport for OpenAiCompatTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, TransportError> {
        let url = self.endpoint(&request.prompt);
        let body = Self::request_body(&request);

        debug!(transport = %self.name, model = %request.model, %url, "Sending streaming request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            sent = builder.send() => sent.map_err(|e| TransportError::Network(e.to_string()))?,
        };

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(status_error(status, error_body));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(self.name.clone(), response, tx, cancel));
        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, TransportError> {
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

/// Map a non-200 status to the transport error taxonomy.
fn status_error(status: u16, body: String) -> TransportError {
    match status {
        429 => TransportError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => TransportError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        _ => {
            warn!(status, body = %body, "Backend returned error");
            TransportError::ApiError {
                status_code: status,
                message: body,
            }
        }
    }
}

/// Read the SSE byte stream and forward cumulative chunks until the stream
/// ends, the receiver goes away or `cancel` fires.
async fn pump(
    name: String,
    response: reqwest::Response,
    tx: mpsc::Sender<Result<TransportChunk, TransportError>>,
    cancel: CancellationToken,
) {
    let mut byte_stream = response.bytes_stream();
    let mut lines = SseBuffer::default();
    let mut acc = StreamAccumulator::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(transport = %name, "Stream cancelled");
                return;
            }
            next = byte_stream.next() => next,
        };

        let Some(result) = next else { break };
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(TransportError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };

        lines.push(&bytes);
        while let Some(line) = lines.next_line() {
            match parse_line(&line) {
                SseLine::Skip => {}
                SseLine::Done => {
                    let _ = tx.send(Ok(acc.snapshot(true))).await;
                    return;
                }
                SseLine::Error(message) => {
                    warn!(transport = %name, error = %message, "Backend reported error mid-stream");
                    let _ = tx.send(Err(TransportError::StreamInterrupted(message))).await;
                    return;
                }
                SseLine::Event(event) => {
                    if acc.apply(event) && tx.send(Ok(acc.snapshot(false))).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }
        }
    }

    // Stream ended without [DONE]
    let _ = tx.send(Ok(acc.snapshot(true))).await;
}

// --- SSE framing ---

/// Splits raw bytes into lines. Bytes are buffered until a newline so a
/// multi-byte character split across reads decodes intact.
#[derive(Debug, Default)]
struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.trim_end_matches('\r').to_string())
    }
}

#[derive(Debug)]
enum SseLine {
    Skip,
    Done,
    Error(String),
    Event(StreamResponse),
}

fn parse_line(line: &str) -> SseLine {
    // Comments, blank separators and `event:`/`id:` fields carry nothing we use
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(StreamResponse {
            error: Some(error), ..
        }) => SseLine::Error(error.message),
        Ok(event) => SseLine::Event(event),
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseLine::Skip
        }
    }
}

/// Folds streamed deltas into cumulative per-candidate state.
#[derive(Debug, Default)]
struct StreamAccumulator {
    /// Text per choice index
    candidates: BTreeMap<u32, String>,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    /// Apply one event. Returns whether anything visible changed.
    fn apply(&mut self, event: StreamResponse) -> bool {
        let mut changed = false;

        for choice in event.choices {
            let text = self.candidates.entry(choice.index).or_default();

            // Text completions put the delta on the choice itself
            if let Some(delta) = choice.text.filter(|t| !t.is_empty()) {
                text.push_str(&delta);
                changed = true;
            }

            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    text.push_str(&content);
                    changed = true;
                }

                // Reasoning and tool calls belong to the primary candidate
                if choice.index == 0 {
                    if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                        self.reasoning.push_str(&reasoning);
                        changed = true;
                    }

                    for tc_delta in delta.tool_calls.unwrap_or_default() {
                        let acc = self.tool_calls.entry(tc_delta.index).or_default();
                        if let Some(id) = tc_delta.id {
                            acc.id = id;
                        }
                        if let Some(func) = tc_delta.function {
                            if let Some(name) = func.name {
                                acc.name = name;
                            }
                            if let Some(args) = func.arguments {
                                acc.arguments.push_str(&args);
                            }
                        }
                        changed = true;
                    }
                }
            }

            if choice.index == 0 && choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
                changed = true;
            }
        }

        changed
    }

    fn snapshot(&self, done: bool) -> TransportChunk {
        TransportChunk {
            text: self.candidates.get(&0).cloned().unwrap_or_default(),
            swipes: self
                .candidates
                .iter()
                .filter(|(index, _)| **index != 0)
                .map(|(_, text)| text.clone())
                .collect(),
            tool_calls: self
                .tool_calls
                .values()
                .filter(|acc| !acc.name.is_empty())
                .map(ToolCallAccumulator::to_invocation)
                .collect(),
            state: ChunkState {
                reasoning: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
                finish_reason: self.finish_reason.clone(),
            },
            done,
        }
    }
}

/// Accumulates incremental tool call deltas into a complete invocation.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn to_invocation(&self) -> ToolInvocation {
        ToolInvocation {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// A single SSE `data: {...}` payload from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: u32,
    /// Chat completions
    #[serde(default)]
    delta: Option<StreamDelta>,
    /// Text completions
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta, arriving incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
