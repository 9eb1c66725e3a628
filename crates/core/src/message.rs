//! Message, swipe and chat history domain types.
//!
//! A message owns an ordered list of alternate texts ("swipes"). The active
//! text always mirrors `swipes[swipe_id]`; every mutator below restores that
//! invariant before returning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SwipeError;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side of the chat
    User,
    /// The model-driven character
    Assistant,
    /// System instructions
    System,
    /// Out-of-character narration
    Narrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Narrator => "narrator",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation reported by the backend for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Backend-assigned call id
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// Metadata recorded for a single swipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwipeInfo {
    pub send_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_finished: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,

    /// The generation producing this swipe was stopped by the user.
    #[serde(default)]
    pub cancelled: bool,
}

/// Typed per-message extras, mirrored from the active swipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub cancelled: bool,
}

/// A single message in a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Display name of the speaker
    pub name: String,

    /// The active text. Always equal to `swipes[swipe_id]`.
    pub text: String,

    /// Alternate candidates for this slot
    pub swipes: Vec<String>,

    /// Index of the active swipe
    pub swipe_id: usize,

    /// Metadata per swipe, parallel to `swipes`
    pub swipe_info: Vec<SwipeInfo>,

    /// When the message was first sent
    pub send_date: DateTime<Utc>,

    #[serde(default)]
    pub extra: MessageExtra,
}

impl Message {
    /// Create a message with a single swipe holding `text`.
    pub fn new(role: Role, name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            name: name.into(),
            swipes: vec![text.clone()],
            text,
            swipe_id: 0,
            swipe_info: vec![SwipeInfo {
                send_date: Some(now),
                ..SwipeInfo::default()
            }],
            send_date: now,
            extra: MessageExtra::default(),
        }
    }

    pub fn user(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::User, name, text)
    }

    pub fn assistant(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, name, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, "System", text)
    }

    pub fn narrator(text: impl Into<String>) -> Self {
        Self::new(Role::Narrator, "Narrator", text)
    }

    /// Replace the active text, keeping the active swipe in sync.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.ensure_slot();
        self.swipes[self.swipe_id] = self.text.clone();
    }

    /// Replace the active swipe's metadata and mirror it into `extra`.
    pub fn set_active_info(&mut self, info: SwipeInfo) {
        self.ensure_slot();
        self.swipe_info[self.swipe_id] = info;
        self.sync_extra();
    }

    /// Append a candidate without changing the selection. Returns its index.
    pub fn add_swipe(&mut self, text: impl Into<String>, info: SwipeInfo) -> usize {
        self.swipes.push(text.into());
        self.swipe_info.push(info);
        self.swipes.len() - 1
    }

    /// Make swipe `index` the active text.
    pub fn select_swipe(&mut self, index: usize) -> Result<(), SwipeError> {
        if index >= self.swipes.len() {
            return Err(SwipeError::OutOfRange {
                index,
                len: self.swipes.len(),
            });
        }
        self.swipe_id = index;
        self.text = self.swipes[index].clone();
        self.sync_extra();
        Ok(())
    }

    /// Move to the previous swipe. Returns `false` at the first swipe.
    pub fn swipe_left(&mut self) -> bool {
        if self.swipe_id == 0 {
            return false;
        }
        self.select_swipe(self.swipe_id - 1).is_ok()
    }

    /// Move to the next swipe. Returns `false` at the last swipe, where the
    /// caller is expected to start a swipe generation instead.
    pub fn swipe_right(&mut self) -> bool {
        if self.swipe_id + 1 >= self.swipes.len() {
            return false;
        }
        self.select_swipe(self.swipe_id + 1).is_ok()
    }

    /// Delete swipe `index`, clamping the active index into range.
    pub fn delete_swipe(&mut self, index: usize) -> Result<(), SwipeError> {
        if index >= self.swipes.len() {
            return Err(SwipeError::OutOfRange {
                index,
                len: self.swipes.len(),
            });
        }
        if self.swipes.len() == 1 {
            return Err(SwipeError::LastSwipe);
        }

        self.swipes.remove(index);
        if index < self.swipe_info.len() {
            self.swipe_info.remove(index);
        }

        let next = if self.swipe_id > index {
            self.swipe_id - 1
        } else {
            self.swipe_id.min(self.swipes.len() - 1)
        };
        self.select_swipe(next)
    }

    pub fn swipe_count(&self) -> usize {
        self.swipes.len()
    }

    /// Metadata of the active swipe.
    pub fn active_info(&self) -> Option<&SwipeInfo> {
        self.swipe_info.get(self.swipe_id)
    }

    fn ensure_slot(&mut self) {
        if self.swipes.is_empty() {
            self.swipes.push(String::new());
            self.swipe_id = 0;
        }
        while self.swipe_info.len() < self.swipes.len() {
            self.swipe_info.push(SwipeInfo::default());
        }
    }

    fn sync_extra(&mut self) {
        let model = self.extra.model.take();
        self.extra = match self.swipe_info.get(self.swipe_id) {
            Some(info) => MessageExtra {
                reasoning: info.reasoning.clone(),
                tool_invocations: info.tool_invocations.clone(),
                token_count: info.token_count,
                model: None,
                cancelled: info.cancelled,
            },
            None => MessageExtra::default(),
        };
        self.extra.model = model;
    }
}

/// The ordered message store of one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    pub messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message and return its index.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    /// Remove and return the message at `index`.
    pub fn delete_message(&mut self, index: usize) -> Result<Message, SwipeError> {
        if index >= self.messages.len() {
            return Err(SwipeError::NoSuchMessage(index));
        }
        Ok(self.messages.remove(index))
    }

    /// Iterate from the most recent message to the oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().rev()
    }
}
