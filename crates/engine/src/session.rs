//! One streaming generation attempt.
//!
//! A [`GenerationSession`] consumes cumulative chunks from a transport,
//! normalizes each one for display, and commits the result into the chat
//! history. The history is written only when the target slot is allocated
//! (first chunk) and at the terminal state; all buffers are owned by the
//! session until then.
//!
//! ```text
//! Idle ──first chunk──▶ Streaming ──done──▶ Finalizing ──▶ Committed
//!                          │
//!                          ├──cancel──▶ Stopped
//!                          └──fault───▶ Errored
//! ```

use std::sync::Arc;
use std::time::Instant;

use chatweave_config::AppConfig;
use chatweave_core::busy::BusyGuard;
use chatweave_core::error::{SessionError, TransportError};
use chatweave_core::event::{
    GenerationType, ObserverRegistry, SessionEvent, SessionObserver, SessionState,
};
use chatweave_core::message::{ChatHistory, Message, Role, SwipeInfo, ToolInvocation};
use chatweave_core::transport::{ChunkReceiver, TransportChunk};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::TokenCounter;
use crate::output::{
    NormalizeOptions, OutputNormalizer, ReasoningParser, ReasoningSplit, StopStringBuilder,
};

/// Text held by a freshly allocated slot until the first real output lands.
pub const PLACEHOLDER: &str = "...";

/// Collaborators shared by every session of a conversation.
#[derive(Debug, Clone)]
pub struct SessionDeps {
    pub normalizer: Arc<OutputNormalizer>,
    pub stops: StopStringBuilder,
    pub reasoning: Option<ReasoningParser>,
    pub counter: Arc<TokenCounter>,
    pub trim_names: bool,
    /// Recorded on committed messages
    pub model: Option<String>,
}

impl SessionDeps {
    pub fn new(normalizer: Arc<OutputNormalizer>, counter: Arc<TokenCounter>) -> Self {
        let stops = StopStringBuilder {
            user_name: normalizer.user_name().to_string(),
            character_name: normalizer.character_name().to_string(),
            group_members: normalizer.group_members().to_vec(),
            ..StopStringBuilder::default()
        };
        Self {
            normalizer,
            stops,
            reasoning: Some(ReasoningParser::default()),
            counter,
            trim_names: true,
            model: None,
        }
    }

    pub fn from_config(config: &AppConfig, counter: Arc<TokenCounter>) -> Self {
        Self {
            normalizer: Arc::new(OutputNormalizer::from_config(config)),
            stops: StopStringBuilder::from_config(config),
            reasoning: ReasoningParser::from_config(&config.reasoning),
            counter,
            trim_names: config.output.trim_names,
            model: Some(config.backend.model.clone()),
        }
    }
}

/// Wall-clock timing of one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub first_token_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub chunk_times: Vec<DateTime<Utc>>,
    pub time_to_first_token_ms: Option<u64>,
    pub elapsed_ms: u64,
}

/// What a session produced.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub generation_type: GenerationType,
    /// Index of the written message; `None` for detached generations
    pub message_index: Option<usize>,
    /// Final text, including the original text for continuations
    pub text: String,
    pub reasoning: Option<String>,
    /// Extra candidates appended as swipes
    pub swipes_added: usize,
    pub token_count: usize,
    pub tool_calls: Vec<ToolInvocation>,
    pub timing: SessionTiming,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Committed(GenerationResult),
    /// Cancelled by the caller; the last good text was kept
    Stopped(GenerationResult),
    Errored {
        error: TransportError,
        result: GenerationResult,
        /// Whether partial text was kept in the history
        preserved: bool,
    },
}

impl SessionOutcome {
    pub fn result(&self) -> &GenerationResult {
        match self {
            Self::Committed(r) | Self::Stopped(r) => r,
            Self::Errored { result, .. } => result,
        }
    }

    pub fn text(&self) -> &str {
        &self.result().text
    }

    pub fn state(&self) -> SessionState {
        match self {
            Self::Committed(_) => SessionState::Committed,
            Self::Stopped(_) => SessionState::Stopped,
            Self::Errored { .. } => SessionState::Errored,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// Where the output lands.
#[derive(Debug)]
enum Slot {
    New {
        index: usize,
    },
    Swipe {
        index: usize,
        previous: usize,
        swipe: usize,
    },
    Regenerate {
        index: usize,
        previous_text: String,
        previous_info: Option<SwipeInfo>,
    },
    Continue {
        index: usize,
        base: String,
    },
    Detached,
}

impl Slot {
    fn index(&self) -> Option<usize> {
        match self {
            Self::New { index }
            | Self::Swipe { index, .. }
            | Self::Regenerate { index, .. }
            | Self::Continue { index, .. } => Some(*index),
            Self::Detached => None,
        }
    }
}

pub struct GenerationSession {
    generation_type: GenerationType,
    /// Name on a newly created message
    speaker: String,
    deps: SessionDeps,
    stop_strings: Vec<String>,
    cancel: CancellationToken,
    observers: ObserverRegistry,
    state: SessionState,

    raw: String,
    candidates: Vec<String>,
    tool_calls: Vec<ToolInvocation>,
    backend_reasoning: Option<String>,
    display: String,
    reasoning: Option<String>,
    chunks_seen: usize,

    slot: Option<Slot>,
    timing: SessionTiming,
    clock: Instant,
    _busy: BusyGuard,
}

impl GenerationSession {
    pub fn new(
        generation_type: GenerationType,
        speaker: impl Into<String>,
        deps: SessionDeps,
        busy: BusyGuard,
    ) -> Self {
        let stop_strings = deps
            .stops
            .build(generation_type == GenerationType::Impersonate);
        Self {
            generation_type,
            speaker: speaker.into(),
            deps,
            stop_strings,
            cancel: CancellationToken::new(),
            observers: ObserverRegistry::new(),
            state: SessionState::Idle,
            raw: String::new(),
            candidates: Vec::new(),
            tool_calls: Vec::new(),
            backend_reasoning: None,
            display: String::new(),
            reasoning: None,
            chunks_seen: 0,
            slot: None,
            timing: SessionTiming::default(),
            clock: Instant::now(),
            _busy: busy,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_observers(mut self, observers: ObserverRegistry) -> Self {
        self.observers = observers;
        self
    }

    pub fn observe(&mut self, observer: impl SessionObserver + 'static) {
        self.observers.register(observer);
    }

    /// A handle that stops this session at its next scheduling point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The stop set, built once when the session was created.
    pub fn stop_strings(&self) -> &[String] {
        &self.stop_strings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation_type(&self) -> GenerationType {
        self.generation_type
    }

    /// Check that the history has something this generation type can target.
    pub fn check_target(&self, history: &ChatHistory) -> Result<(), SessionError> {
        let action = match self.generation_type {
            GenerationType::Continue => "continue",
            GenerationType::Swipe => "swipe",
            GenerationType::Regenerate => "regenerate",
            _ => return Ok(()),
        };
        let last = history.last().ok_or(SessionError::EmptyHistory(action))?;
        let allowed = match self.generation_type {
            GenerationType::Continue => matches!(last.role, Role::User | Role::Assistant),
            _ => last.role == Role::Assistant,
        };
        if !allowed {
            return Err(SessionError::WrongTarget {
                action,
                role: last.role.to_string(),
            });
        }
        Ok(())
    }

    /// The transport failed to open: `Idle → Errored`, history untouched.
    pub fn fail(mut self, error: TransportError) -> SessionOutcome {
        self.begin();
        let mut history = ChatHistory::new();
        self.error(&mut history, error)
    }

    /// Cancelled before the transport opened: `Idle → Stopped`, history untouched.
    pub fn cancelled(mut self) -> SessionOutcome {
        self.begin();
        let mut history = ChatHistory::new();
        self.stop(&mut history)
    }

    /// Drive the session to a terminal state.
    pub async fn run(
        mut self,
        history: &mut ChatHistory,
        mut chunks: ChunkReceiver,
    ) -> Result<SessionOutcome, SessionError> {
        self.check_target(history)?;
        self.begin();
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.stop(history));
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = chunks.recv() => Some(item),
            };
            let Some(item) = next else {
                return Ok(self.stop(history));
            };
            match item {
                None => return Ok(self.finish(history)),
                Some(Err(e)) => return Ok(self.error(history, e)),
                Some(Ok(chunk)) => {
                    let done = chunk.done;
                    self.accept(history, chunk);
                    if done {
                        return Ok(self.finish(history));
                    }
                }
            }
        }
    }

    // ── Transitions ───────────────────────────────────────────────────────

    fn begin(&mut self) {
        let now = Utc::now();
        self.clock = Instant::now();
        self.timing.started_at = Some(now);
        info!(
            generation_type = self.generation_type.as_str(),
            stop_strings = self.stop_strings.len(),
            "Generation started"
        );
        self.observers.emit(&SessionEvent::Started {
            generation_type: self.generation_type,
            started_at: now,
        });
    }

    fn accept(&mut self, history: &mut ChatHistory, chunk: TransportChunk) {
        if self.state == SessionState::Idle {
            self.allocate(history);
            self.state = SessionState::Streaming;
        }

        let now = Utc::now();
        self.timing.chunk_times.push(now);
        if self.timing.first_token_at.is_none() && !chunk.text.is_empty() {
            self.timing.first_token_at = Some(now);
            self.timing.time_to_first_token_ms = Some(self.elapsed_ms());
        }

        self.raw = chunk.text;
        self.candidates = chunk.swipes;
        if !chunk.tool_calls.is_empty() {
            self.tool_calls = chunk.tool_calls;
        }
        if let Some(reasoning) = chunk.state.reasoning.filter(|r| !r.is_empty()) {
            self.backend_reasoning = Some(reasoning);
        }

        let (reasoning, display) = self.render(&self.raw, true);
        self.display = display;
        self.reasoning = reasoning;

        let index = self.chunks_seen;
        self.chunks_seen += 1;
        debug!(index, chars = self.display.len(), "Chunk normalized");

        self.observers.emit(&SessionEvent::Chunk {
            index,
            text: self.full_text(&self.display),
            reasoning: self.reasoning.clone(),
            elapsed_ms: self.elapsed_ms(),
        });
    }

    fn finish(mut self, history: &mut ChatHistory) -> SessionOutcome {
        if self.state == SessionState::Idle {
            return self.error(
                history,
                TransportError::StreamInterrupted("stream closed before any output".into()),
            );
        }

        self.state = SessionState::Finalizing;
        let (reasoning, text) = self.render(&self.raw, false);
        let candidates: Vec<String> = self
            .candidates
            .iter()
            .map(|c| self.render(c, false).1)
            .filter(|c| !c.is_empty())
            .collect();

        let result = self.commit(history, text, reasoning, candidates, false);
        self.state = SessionState::Committed;

        let swipe_count = result
            .message_index
            .and_then(|i| history.get(i))
            .map(|m| m.swipe_count())
            .unwrap_or(1 + result.swipes_added);
        info!(
            generation_type = self.generation_type.as_str(),
            tokens = result.token_count,
            elapsed_ms = result.timing.elapsed_ms,
            "Generation committed"
        );
        self.observers.emit(&SessionEvent::Committed {
            message_index: result.message_index,
            text: result.text.clone(),
            swipe_count,
        });
        SessionOutcome::Committed(result)
    }

    fn stop(mut self, history: &mut ChatHistory) -> SessionOutcome {
        info!(
            generation_type = self.generation_type.as_str(),
            chunks = self.chunks_seen,
            "Generation stopped"
        );
        let result = if self.state == SessionState::Idle {
            self.detached_result(String::new())
        } else if self.display.trim().is_empty() {
            let kept = self.rollback(history);
            let mut result = self.detached_result(String::new());
            result.message_index = kept;
            result
        } else {
            let text = self.display.clone();
            let reasoning = self.reasoning.clone();
            self.commit(history, text, reasoning, Vec::new(), true)
        };
        self.state = SessionState::Stopped;
        self.observers.emit(&SessionEvent::Stopped {
            message_index: result.message_index,
            text: result.text.clone(),
            cancelled: true,
        });
        SessionOutcome::Stopped(result)
    }

    fn error(mut self, history: &mut ChatHistory, error: TransportError) -> SessionOutcome {
        warn!(
            generation_type = self.generation_type.as_str(),
            error = %error,
            "Generation failed"
        );
        let has_text = !self.display.trim().is_empty();
        let (result, preserved) = match self.state {
            SessionState::Streaming | SessionState::Finalizing if has_text => {
                let text = self.display.clone();
                let reasoning = self.reasoning.clone();
                (self.commit(history, text, reasoning, Vec::new(), false), true)
            }
            _ => {
                let kept = self.rollback(history);
                let mut result = self.detached_result(String::new());
                result.message_index = kept;
                (result, false)
            }
        };
        self.state = SessionState::Errored;
        self.observers.emit(&SessionEvent::Errored {
            message_index: result.message_index,
            error: error.to_string(),
            preserved,
        });
        SessionOutcome::Errored {
            error,
            result,
            preserved,
        }
    }

    // ── History writes ────────────────────────────────────────────────────

    fn allocate(&mut self, history: &mut ChatHistory) {
        let started = self.timing.started_at;
        let slot = match self.generation_type {
            GenerationType::Normal => {
                let mut message = Message::assistant(self.speaker.clone(), PLACEHOLDER);
                message.set_active_info(SwipeInfo {
                    send_date: started,
                    gen_started: started,
                    ..SwipeInfo::default()
                });
                Slot::New {
                    index: history.push(message),
                }
            }
            kind if !kind.targets_history() => Slot::Detached,
            kind => {
                let index = history.len().saturating_sub(1);
                let Some(message) = history.get_mut(index) else {
                    warn!(generation_type = kind.as_str(), "No message to target");
                    self.slot = Some(Slot::Detached);
                    return;
                };
                match kind {
                    GenerationType::Swipe => {
                        let previous = message.swipe_id;
                        let swipe = message.add_swipe(
                            PLACEHOLDER,
                            SwipeInfo {
                                send_date: started,
                                gen_started: started,
                                ..SwipeInfo::default()
                            },
                        );
                        if let Err(e) = message.select_swipe(swipe) {
                            warn!(error = %e, "Could not select new swipe");
                        }
                        Slot::Swipe {
                            index,
                            previous,
                            swipe,
                        }
                    }
                    GenerationType::Regenerate => {
                        let previous_text = message.text.clone();
                        let previous_info = message.active_info().cloned();
                        message.set_text(PLACEHOLDER);
                        Slot::Regenerate {
                            index,
                            previous_text,
                            previous_info,
                        }
                    }
                    _ => Slot::Continue {
                        index,
                        base: message.text.clone(),
                    },
                }
            }
        };
        debug!(slot = ?slot, "Slot allocated");
        self.slot = Some(slot);
    }

    fn commit(
        &mut self,
        history: &mut ChatHistory,
        generated: String,
        reasoning: Option<String>,
        candidates: Vec<String>,
        cancelled: bool,
    ) -> GenerationResult {
        let finished = Utc::now();
        self.timing.finished_at = Some(finished);
        self.timing.elapsed_ms = self.elapsed_ms();

        let text = self.full_text(&generated);
        let token_count = self.deps.counter.count(&text);
        let info = SwipeInfo {
            send_date: self.timing.started_at,
            gen_started: self.timing.started_at,
            gen_finished: Some(finished),
            token_count: Some(token_count),
            reasoning: reasoning.clone(),
            tool_invocations: self.tool_calls.clone(),
            cancelled,
        };

        let mut swipes_added = 0;
        let target = self.slot.as_ref().and_then(Slot::index);
        let message_index = match target.and_then(|i| history.get_mut(i).map(|m| (i, m))) {
            Some((index, message)) => {
                message.set_text(text.clone());
                message.set_active_info(info);
                if self.deps.model.is_some() {
                    message.extra.model = self.deps.model.clone();
                }
                for candidate in candidates {
                    let full = self.full_text(&candidate);
                    let candidate_info = SwipeInfo {
                        token_count: Some(self.deps.counter.count(&full)),
                        reasoning: None,
                        tool_invocations: Vec::new(),
                        ..message.active_info().cloned().unwrap_or_default()
                    };
                    message.add_swipe(full, candidate_info);
                    swipes_added += 1;
                }
                Some(index)
            }
            None => {
                if target.is_some() {
                    warn!("Target message vanished before commit");
                }
                None
            }
        };

        GenerationResult {
            generation_type: self.generation_type,
            message_index,
            text,
            reasoning,
            swipes_added,
            token_count,
            tool_calls: self.tool_calls.clone(),
            timing: self.timing.clone(),
        }
    }

    /// Undo a placeholder-only allocation. Returns the index of a message
    /// that still exists afterwards.
    fn rollback(&mut self, history: &mut ChatHistory) -> Option<usize> {
        match self.slot.take()? {
            Slot::New { index } => {
                if let Err(e) = history.delete_message(index) {
                    warn!(error = %e, "Could not remove placeholder message");
                }
                None
            }
            Slot::Swipe {
                index,
                previous,
                swipe,
            } => {
                let message = history.get_mut(index)?;
                if let Err(e) = message.delete_swipe(swipe) {
                    warn!(error = %e, "Could not remove placeholder swipe");
                }
                if let Err(e) = message.select_swipe(previous) {
                    warn!(error = %e, "Could not restore previous swipe");
                }
                Some(index)
            }
            Slot::Regenerate {
                index,
                previous_text,
                previous_info,
            } => {
                let message = history.get_mut(index)?;
                message.set_text(previous_text);
                if let Some(info) = previous_info {
                    message.set_active_info(info);
                }
                Some(index)
            }
            Slot::Continue { index, .. } => Some(index),
            Slot::Detached => None,
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn render(&self, raw: &str, streaming: bool) -> (Option<String>, String) {
        let split = match &self.deps.reasoning {
            Some(parser) => parser.split(raw),
            None => ReasoningSplit {
                reasoning: None,
                display: raw.to_string(),
                closed: true,
            },
        };
        let reasoning = self
            .backend_reasoning
            .clone()
            .or(split.reasoning)
            .filter(|r| !r.is_empty());

        let options = NormalizeOptions {
            is_impersonate: self.generation_type == GenerationType::Impersonate,
            is_continue: self.generation_type == GenerationType::Continue,
            stop_strings: &self.stop_strings,
            display_incomplete_sentences: streaming,
            trim_names: self.deps.trim_names,
        };
        (reasoning, self.deps.normalizer.normalize(&split.display, &options))
    }

    fn full_text(&self, generated: &str) -> String {
        match &self.slot {
            Some(Slot::Continue { base, .. }) => format!("{base}{generated}"),
            _ => generated.to_string(),
        }
    }

    fn detached_result(&mut self, text: String) -> GenerationResult {
        self.timing.finished_at = Some(Utc::now());
        self.timing.elapsed_ms = self.elapsed_ms();
        GenerationResult {
            generation_type: self.generation_type,
            message_index: None,
            text,
            reasoning: None,
            swipes_added: 0,
            token_count: 0,
            tool_calls: Vec::new(),
            timing: self.timing.clone(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("generation_type", &self.generation_type)
            .field("state", &self.state)
            .field("chunks_seen", &self.chunks_seen)
            .field("slot", &self.slot)
            .finish()
    }
}
