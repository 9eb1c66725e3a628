//! Session events and observer registration.
//!
//! Observers are called synchronously, in registration order, before the
//! session requests the next chunk. An observer that needs to stop the
//! generation holds a clone of the session's cancellation token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a generation produces and where it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
    /// A new assistant message
    Normal,
    /// Append to the last message's active swipe
    Continue,
    /// A new candidate for the last message
    Swipe,
    /// Overwrite the last message's active swipe
    Regenerate,
    /// Write on the user's behalf; detached from the history
    Impersonate,
    /// Background generation; detached from the history
    Quiet,
}

impl GenerationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Continue => "continue",
            Self::Swipe => "swipe",
            Self::Regenerate => "regenerate",
            Self::Impersonate => "impersonate",
            Self::Quiet => "quiet",
        }
    }

    /// Whether the output is written into the chat history.
    pub fn targets_history(&self) -> bool {
        !matches!(self, Self::Impersonate | Self::Quiet)
    }
}

/// The lifecycle state of a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Finalizing,
    Committed,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Stopped | Self::Errored)
    }
}

/// Events emitted by a generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session started waiting for the first chunk.
    Started {
        generation_type: GenerationType,
        started_at: DateTime<Utc>,
    },

    /// A chunk was normalized. `text` is what a UI should display now.
    Chunk {
        index: usize,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        elapsed_ms: u64,
    },

    /// The generation finished and its text was committed.
    Committed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<usize>,
        text: String,
        swipe_count: usize,
    },

    /// The user cancelled; the last good text was committed.
    Stopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<usize>,
        text: String,
        cancelled: bool,
    },

    /// The transport failed.
    Errored {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<usize>,
        error: String,
        preserved: bool,
    },
}

impl SessionEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Chunk { .. } => "chunk",
            Self::Committed { .. } => "committed",
            Self::Stopped { .. } => "stopped",
            Self::Errored { .. } => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed { .. } | Self::Stopped { .. } | Self::Errored { .. }
        )
    }
}

/// Receives session events.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) {
        self(event)
    }
}

/// Observers in registration order.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: impl SessionObserver + 'static) {
        self.observers.push(Arc::new(observer));
    }

    /// Deliver `event` to every observer, in registration order.
    pub fn emit(&self, event: &SessionEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.len())
            .finish()
    }
}
