//! Transport trait: the abstraction over streaming LLM backends.
//!
//! A transport takes a packed request and yields a channel of cumulative
//! chunks: every chunk carries the full text generated so far, not a delta.
//! The stream ends with a chunk marked `done`, with the channel closing, or
//! with an error item.
//!
//! Implementations: OpenAI-compatible SSE, scripted replay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::message::{Role, ToolInvocation};

/// One role-tagged turn of a chat-style prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub content: String,
}

/// The prompt body sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PromptPayload {
    /// A single text-completion prompt
    Text(String),
    /// Role-tagged chat turns
    Chat(Vec<ChatTurn>),
}

/// Configuration for one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The model to use
    pub model: String,

    /// The packed prompt
    pub prompt: PromptPayload,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences forwarded to the backend
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Number of candidates to generate; extras arrive as swipes
    #[serde(default = "default_candidates")]
    pub candidates: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_candidates() -> u32 {
    1
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: PromptPayload) -> Self {
        Self {
            model: model.into(),
            prompt,
            temperature: default_temperature(),
            max_tokens: None,
            stop: Vec::new(),
            candidates: default_candidates(),
        }
    }
}

/// Backend-side state carried alongside a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkState {
    /// Reasoning text reported out-of-band by the backend (cumulative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Why the backend stopped, when it says so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// A single cumulative chunk of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportChunk {
    /// Full text of the primary candidate so far
    #[serde(default)]
    pub text: String,

    /// Full text of every additional candidate so far
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub swipes: Vec<String>,

    /// Tool calls completed so far
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    #[serde(default)]
    pub state: ChunkState,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,
}

impl TransportChunk {
    /// An intermediate chunk.
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// The final chunk of a stream.
    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
            ..Self::default()
        }
    }
}

/// Receiving half of a transport's chunk channel.
pub type ChunkReceiver = mpsc::Receiver<Result<TransportChunk, TransportError>>;

/// The core Transport trait.
///
/// The cancellation token is handed over at creation; implementations check
/// it between chunks and stop producing once it fires.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A human-readable name for this transport (e.g., "openai-compat").
    fn name(&self) -> &str;

    /// Open a stream for `request`.
    async fn open(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, TransportError>;

    /// Health check: can we reach the backend?
    async fn health_check(&self) -> Result<bool, TransportError> {
        Ok(true)
    }
}
