//! Per-conversation state and the generation entry point.
//!
//! [`ConversationContext`] owns the chat history, the injection registry and
//! the busy flag. Packing runs before any network call, so an overflow is
//! reported without touching the transport.

use std::sync::Arc;

use chatweave_config::{AppConfig, BackendConfig};
use chatweave_core::busy::BusyFlag;
use chatweave_core::error::{Result, SessionError, TransportError};
use chatweave_core::event::{GenerationType, ObserverRegistry, SessionObserver};
use chatweave_core::message::{ChatHistory, Role};
use chatweave_core::transport::{GenerationRequest, Transport};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::{
    HistoryTurn, InjectionRegistry, PackInput, PackOptions, PackedPrompt, PromptPacker,
    PromptTail, TokenCounter,
};
use crate::session::{GenerationSession, SessionDeps, SessionOutcome};

pub struct ConversationContext {
    pub history: ChatHistory,
    pub injections: InjectionRegistry,
    /// Character description and scenario, always kept in the prompt
    pub story: String,
    /// Example dialogue blocks, in configured order
    pub examples: Vec<String>,
    user_name: String,
    character_name: String,
    backend: BackendConfig,
    max_response: usize,
    packer: PromptPacker,
    deps: SessionDeps,
    observers: ObserverRegistry,
    busy: BusyFlag,
}

impl ConversationContext {
    pub fn new(config: &AppConfig, counter: Arc<TokenCounter>) -> Self {
        Self {
            history: ChatHistory::new(),
            injections: InjectionRegistry::new(),
            story: String::new(),
            examples: Vec::new(),
            user_name: config.names.user.clone(),
            character_name: config.names.character.clone(),
            backend: config.backend.clone(),
            max_response: config.context.max_response,
            packer: PromptPacker::new(PackOptions::from_config(config), counter.clone()),
            deps: SessionDeps::from_config(config, counter),
            observers: ObserverRegistry::new(),
            busy: BusyFlag::new(),
        }
    }

    pub fn with_history(mut self, history: ChatHistory) -> Self {
        self.history = history;
        self
    }

    pub fn with_story(mut self, story: impl Into<String>) -> Self {
        self.story = story.into();
        self
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }

    /// Extra participants of a group chat. Their `Name:` lines stop and trim output.
    pub fn with_group_members(mut self, members: Vec<String>) -> Self {
        let normalizer = self.deps.normalizer.as_ref().clone();
        self.deps.normalizer = Arc::new(normalizer.with_group_members(members.clone()));
        self.deps.stops.group_members = members;
        self
    }

    /// Register an observer attached to every session of this conversation.
    pub fn observe(&mut self, observer: impl SessionObserver + 'static) {
        self.observers.register(observer);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn character_name(&self) -> &str {
        &self.character_name
    }

    /// Resolve injections and pack the prompt for `generation_type`.
    ///
    /// Swipes and regenerations leave out the reply they replace; a
    /// continuation packs the last message as the open tail.
    pub async fn pack(&self, generation_type: GenerationType) -> Result<PackedPrompt> {
        let resolved = self.injections.resolve_for_prompt().await;
        let mut turns: Vec<HistoryTurn> =
            self.history.newest_first().map(HistoryTurn::from).collect();

        let continuation = match generation_type {
            GenerationType::Continue => {
                if turns.is_empty() {
                    return Err(SessionError::EmptyHistory("continue").into());
                }
                Some(turns.remove(0))
            }
            GenerationType::Swipe | GenerationType::Regenerate => {
                if turns.is_empty() {
                    return Err(SessionError::EmptyHistory(generation_type.as_str()).into());
                }
                turns.remove(0);
                None
            }
            _ => None,
        };

        let tail = match (&continuation, generation_type) {
            (Some(turn), _) => PromptTail::Continuation(turn),
            (None, GenerationType::Impersonate) => PromptTail::Cue {
                role: Role::User,
                name: &self.user_name,
            },
            (None, _) => PromptTail::Cue {
                role: Role::Assistant,
                name: &self.character_name,
            },
        };

        let input = PackInput {
            story: &self.story,
            examples: &self.examples,
            history: &turns,
            injections: &resolved,
            tail,
        };
        Ok(self.packer.pack(&input)?)
    }

    /// Build the backend request for a packed prompt.
    pub fn request(&self, packed: &PackedPrompt, stop: &[String]) -> GenerationRequest {
        let mut request = GenerationRequest::new(
            self.backend.model.clone(),
            packed.payload(self.backend.api_style),
        );
        request.temperature = self.backend.temperature;
        request.max_tokens = u32::try_from(self.max_response).ok();
        request.stop = stop.to_vec();
        request.candidates = self.backend.candidates;
        request
    }

    /// Claim the busy flag and create a session for `generation_type`.
    pub fn begin(&self, generation_type: GenerationType) -> Result<GenerationSession> {
        let guard = self.busy.try_acquire()?;
        let speaker = match generation_type {
            GenerationType::Impersonate => self.user_name.clone(),
            _ => self.character_name.clone(),
        };
        let session = GenerationSession::new(generation_type, speaker, self.deps.clone(), guard)
            .with_observers(self.observers.clone());
        session.check_target(&self.history)?;
        Ok(session)
    }

    /// Pack, open the transport, and stream one generation into the history.
    pub async fn generate(
        &mut self,
        generation_type: GenerationType,
        transport: &dyn Transport,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        let session = self
            .begin(generation_type)?
            .with_cancel_token(cancel.clone());
        let packed = self.pack(generation_type).await?;
        let request = self.request(&packed, session.stop_strings());

        info!(
            transport = transport.name(),
            generation_type = generation_type.as_str(),
            prompt_tokens = packed.total_tokens(),
            ceiling = packed.ceiling(),
            "Opening stream"
        );

        if cancel.is_cancelled() {
            return Ok(session.cancelled());
        }
        let chunks = match transport.open(request, cancel.clone()).await {
            Ok(chunks) => chunks,
            Err(TransportError::Cancelled) => return Ok(session.cancelled()),
            Err(_) if cancel.is_cancelled() => return Ok(session.cancelled()),
            Err(e) => return Ok(session.fail(e)),
        };
        Ok(session.run(&mut self.history, chunks).await?)
    }
}

impl std::fmt::Debug for ConversationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationContext")
            .field("messages", &self.history.len())
            .field("injections", &self.injections.len())
            .field("examples", &self.examples.len())
            .field("busy", &self.busy.is_busy())
            .finish()
    }
}
