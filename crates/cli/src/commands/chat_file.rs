//! The JSON chat file read by `pack` and `generate`.
//!
//! ```json
//! {
//!   "character_name": "Aria",
//!   "story": "Aria is a wandering bard.",
//!   "examples": ["User: Hi\nAria: Well met!"],
//!   "history": [{"role": "user", "text": "Play a tune."}],
//!   "injections": [{"id": "mood", "text": "[Aria is cheerful]", "depth": 1}]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use chatweave_config::AppConfig;
use chatweave_core::message::{ChatHistory, Message, Role, SwipeInfo};
use chatweave_engine::{ConversationContext, InjectionPosition, TokenCounter};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatFile {
    pub user_name: Option<String>,
    pub character_name: Option<String>,
    pub story: String,
    pub examples: Vec<String>,
    pub group_members: Vec<String>,
    pub history: Vec<ChatLine>,
    pub injections: Vec<InjectionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ChatLine {
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Alternate candidates; `text` is ignored when present
    #[serde(default)]
    pub swipes: Vec<String>,
    #[serde(default)]
    pub swipe_id: usize,
}

#[derive(Debug, Deserialize)]
pub struct InjectionEntry {
    pub id: String,
    pub text: String,
    #[serde(default = "default_position")]
    pub position: InjectionPosition,
    #[serde(default)]
    pub depth: usize,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub scan: bool,
}

fn default_position() -> InjectionPosition {
    InjectionPosition::InChat
}

fn default_role() -> Role {
    Role::System
}

impl ChatFile {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(serde_json::from_str(json)?)
    }

    /// Names in the file override the configured ones.
    pub fn apply_names(&self, config: &mut AppConfig) {
        if let Some(user) = &self.user_name {
            config.names.user = user.clone();
        }
        if let Some(character) = &self.character_name {
            config.names.character = character.clone();
        }
    }

    pub fn history(&self, config: &AppConfig) -> Result<ChatHistory, Box<dyn std::error::Error>> {
        let mut messages = Vec::with_capacity(self.history.len());
        for (i, line) in self.history.iter().enumerate() {
            let name = line.name.clone().unwrap_or_else(|| match line.role {
                Role::User => config.names.user.clone(),
                Role::Assistant => config.names.character.clone(),
                Role::System => "System".into(),
                Role::Narrator => "Narrator".into(),
            });

            let mut candidates = line.swipes.iter();
            let first = candidates.next().unwrap_or(&line.text);
            let mut message = Message::new(line.role, name, first.clone());
            for swipe in candidates {
                message.add_swipe(swipe.clone(), SwipeInfo::default());
            }
            message
                .select_swipe(line.swipe_id)
                .map_err(|e| format!("history[{i}]: {e}"))?;
            messages.push(message);
        }
        Ok(ChatHistory::from_messages(messages))
    }

    /// Build a conversation from the file. Call [`ChatFile::apply_names`] first.
    pub fn into_conversation(
        self,
        config: &AppConfig,
        counter: Arc<TokenCounter>,
    ) -> Result<ConversationContext, Box<dyn std::error::Error>> {
        let history = self.history(config)?;
        let mut conversation = ConversationContext::new(config, counter)
            .with_history(history)
            .with_story(self.story)
            .with_examples(self.examples);
        if !self.group_members.is_empty() {
            conversation = conversation.with_group_members(self.group_members);
        }

        for entry in self.injections {
            conversation.injections.set(
                entry.id,
                entry.text,
                entry.position,
                entry.depth,
                entry.role,
                entry.scan,
                None,
            );
        }
        Ok(conversation)
    }
}
