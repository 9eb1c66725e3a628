//! Separates a leading reasoning block from the reply text.

use chatweave_config::ReasoningConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningParser {
    prefix: String,
    suffix: String,
}

/// Output of [`ReasoningParser::split`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningSplit {
    pub reasoning: Option<String>,
    pub display: String,
    /// False while the block is still open
    pub closed: bool,
}

impl ReasoningParser {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// `None` when auto-parsing is off.
    pub fn from_config(config: &ReasoningConfig) -> Option<Self> {
        config
            .auto_parse
            .then(|| Self::new(config.prefix.clone(), config.suffix.clone()))
    }

    pub fn split(&self, text: &str) -> ReasoningSplit {
        let lead = text.trim_start();

        if !lead.starts_with(&self.prefix) {
            // A prefix still arriving mid-stream shows nothing yet.
            if !lead.is_empty() && self.prefix.starts_with(lead) {
                return ReasoningSplit {
                    reasoning: Some(String::new()),
                    display: String::new(),
                    closed: false,
                };
            }
            return ReasoningSplit {
                reasoning: None,
                display: text.to_string(),
                closed: true,
            };
        }

        let inner = &lead[self.prefix.len()..];
        match inner.find(&self.suffix) {
            Some(end) => ReasoningSplit {
                reasoning: Some(inner[..end].trim().to_string()),
                display: inner[end + self.suffix.len()..].trim_start().to_string(),
                closed: true,
            },
            None => ReasoningSplit {
                reasoning: Some(inner.trim().to_string()),
                display: String::new(),
                closed: false,
            },
        }
    }
}

impl Default for ReasoningParser {
    fn default() -> Self {
        Self::new("<think>", "</think>")
    }
}
