//! Named prompt injections.
//!
//! Callers register text fragments under an id before each generation pass.
//! Each id maps to at most one live injection; registering again replaces it.
//! Resolution is deterministic: matching injections are concatenated in
//! ascending id order, whatever order their predicates finish in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chatweave_core::message::Role;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Separator used when resolving injections for prompt assembly.
pub const DEFAULT_SEPARATOR: &str = "\n";

/// Where an injection lands in the assembled prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    /// Ahead of the story string
    BeforeStory,
    /// Inside the chat history, `depth` turns from the tail
    InChat,
    /// After the story string, ahead of examples and history
    BeforeRequest,
}

/// An async gate evaluated at resolve time.
pub type Predicate = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Build a [`Predicate`] from an async closure.
pub fn predicate<F, Fut>(f: F) -> Predicate
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Clone)]
pub struct Injection {
    pub id: String,
    pub text: String,
    pub position: InjectionPosition,
    /// 0 = nearest to the generation point
    pub depth: usize,
    pub role: Role,
    /// Whether context providers may scan this text
    pub scan: bool,
    predicate: Option<Predicate>,
    seq: u64,
}

impl Injection {
    async fn passes(&self) -> bool {
        match &self.predicate {
            Some(p) => p().await,
            None => true,
        }
    }

    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }
}

impl std::fmt::Debug for Injection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injection")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("depth", &self.depth)
            .field("role", &self.role)
            .field("scan", &self.scan)
            .field("predicate", &self.predicate.is_some())
            .field("text", &self.text)
            .finish()
    }
}

/// Resolved in-chat text for one (depth, role) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthInjection {
    pub depth: usize,
    pub role: Role,
    pub text: String,
}

/// Everything the packer needs from the registry for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInjections {
    pub before_story: String,
    pub before_request: String,
    /// Sorted by depth, then system, user, assistant
    pub in_chat: Vec<DepthInjection>,
}

impl ResolvedInjections {
    pub fn is_empty(&self) -> bool {
        self.before_story.is_empty() && self.before_request.is_empty() && self.in_chat.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct InjectionRegistry {
    entries: BTreeMap<String, Injection>,
    next_seq: u64,
}

impl InjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `text` under `id`, replacing any previous injection with that id.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        id: impl Into<String>,
        text: impl Into<String>,
        position: InjectionPosition,
        depth: usize,
        role: Role,
        scan: bool,
        predicate: Option<Predicate>,
    ) {
        let id = id.into();
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(id = %id, ?position, depth, "Injection set");
        self.entries.insert(
            id.clone(),
            Injection {
                id,
                text: text.into(),
                position,
                depth,
                role,
                scan,
                predicate,
                seq,
            },
        );
    }

    /// Remove the injection registered under `id`. Returns whether one existed.
    pub fn clear(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: &str) -> Option<&Injection> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Concatenate every injection matching the filters whose predicate holds.
    ///
    /// Texts are trimmed, empty ones skipped, and the result is joined and
    /// wrapped with `separator`. No match yields an empty string.
    pub async fn resolve(
        &self,
        position: InjectionPosition,
        depth: Option<usize>,
        role: Option<Role>,
        separator: &str,
    ) -> String {
        let mut candidates: Vec<&Injection> = self
            .entries
            .values()
            .filter(|i| i.position == position)
            .filter(|i| depth.is_none_or(|d| i.depth == d))
            .filter(|i| role.is_none_or(|r| i.role == r))
            .collect();
        // Ids are unique, so this is id order; seq only matters if that changes.
        candidates.sort_by(|a, b| a.id.cmp(&b.id).then(a.seq.cmp(&b.seq)));

        let verdicts = join_all(candidates.iter().map(|i| i.passes())).await;

        let parts: Vec<&str> = candidates
            .iter()
            .zip(verdicts)
            .filter(|(_, keep)| *keep)
            .map(|(i, _)| i.text.trim())
            .filter(|t| !t.is_empty())
            .collect();

        if parts.is_empty() {
            return String::new();
        }
        format!("{separator}{}{separator}", parts.join(separator))
    }

    /// Texts of injections flagged for scanning, in id order.
    pub fn scan_texts(&self) -> Vec<&str> {
        self.entries
            .values()
            .filter(|i| i.scan)
            .map(|i| i.text.as_str())
            .filter(|t| !t.trim().is_empty())
            .collect()
    }

    /// Resolve everything the packer consumes for one generation pass.
    pub async fn resolve_for_prompt(&self) -> ResolvedInjections {
        let before_story = self
            .resolve(InjectionPosition::BeforeStory, None, None, DEFAULT_SEPARATOR)
            .await;
        let before_request = self
            .resolve(InjectionPosition::BeforeRequest, None, None, DEFAULT_SEPARATOR)
            .await;

        let depths: BTreeSet<usize> = self
            .entries
            .values()
            .filter(|i| i.position == InjectionPosition::InChat)
            .map(|i| i.depth)
            .collect();

        let mut in_chat = Vec::new();
        for depth in depths {
            for role in [Role::System, Role::User, Role::Assistant, Role::Narrator] {
                let text = self
                    .resolve(
                        InjectionPosition::InChat,
                        Some(depth),
                        Some(role),
                        DEFAULT_SEPARATOR,
                    )
                    .await;
                if !text.is_empty() {
                    in_chat.push(DepthInjection { depth, role, text });
                }
            }
        }

        ResolvedInjections {
            before_story,
            before_request,
            in_chat,
        }
    }
}
