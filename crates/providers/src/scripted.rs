//! Replays a fixed chunk list instead of calling a backend.
//!
//! Used by tests and by `chatweave generate --script` for dry runs.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chatweave_core::error::TransportError;
use chatweave_core::transport::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
enum Step {
    Chunk(TransportChunk),
    Fail(TransportError),
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: Vec<Step>,
    delay: Option<Duration>,
    open_error: Option<TransportError>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedTransport {
    /// Replay `chunks` as given, `done` flags included.
    pub fn new(chunks: Vec<TransportChunk>) -> Self {
        Self {
            steps: chunks.into_iter().map(Step::Chunk).collect(),
            ..Self::default()
        }
    }

    /// Cumulative texts; the last one is marked final.
    pub fn from_texts<S: AsRef<str>>(texts: &[S]) -> Self {
        let mut chunks: Vec<TransportChunk> = texts
            .iter()
            .map(|t| TransportChunk::partial(t.as_ref()))
            .collect();
        if let Some(last) = chunks.last_mut() {
            last.done = true;
        }
        Self::new(chunks)
    }

    /// Deltas, accumulated into cumulative chunks; the last one is marked final.
    pub fn from_deltas<S: AsRef<str>>(deltas: &[S]) -> Self {
        let mut text = String::new();
        let texts: Vec<String> = deltas
            .iter()
            .map(|d| {
                text.push_str(d.as_ref());
                text.clone()
            })
            .collect();
        Self::from_texts(texts.as_slice())
    }

    /// Parse a JSON array of chunks.
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let chunks: Vec<TransportChunk> = serde_json::from_str(json)
            .map_err(|e| TransportError::MalformedChunk(e.to_string()))?;
        Ok(Self::new(chunks))
    }

    /// A transport whose `open` fails.
    pub fn failing(error: TransportError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::default()
        }
    }

    /// Append a mid-stream failure after the scripted chunks.
    pub fn then_fail(mut self, error: TransportError) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    /// Pause before each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }

        let (tx, rx) = mpsc::channel(self.steps.len().max(1));
        let steps = self.steps.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            for (i, step) in steps.into_iter().enumerate() {
                if let Some(delay) = delay {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                let item = match step {
                    Step::Chunk(chunk) => Ok(chunk),
                    Step::Fail(error) => Err(error),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
                debug!(step = i, "Scripted chunk sent");
            }
        });

        Ok(rx)
    }
}
