//! Configuration loading, validation, and management for chatweave.
//!
//! Loads configuration from `~/.chatweave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.chatweave/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backend connection settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Context window and packing settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Output cleanup settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Instruct template sequences
    #[serde(default)]
    pub instruct: InstructConfig,

    /// Reasoning block markers
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Token counting backend
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Participant names
    #[serde(default)]
    pub names: NamesConfig,
}

/// Which completion endpoint the backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    /// `/chat/completions` with role-tagged turns
    Chat,
    /// `/completions` with a single text prompt
    Text,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_api_style")]
    pub api_style: ApiStyle,

    /// Candidates requested per generation; extras become swipes
    #[serde(default = "default_candidates")]
    pub candidates: u32,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_api_style() -> ApiStyle {
    ApiStyle::Chat
}
fn default_candidates() -> u32 {
    1
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            api_style: default_api_style(),
            candidates: default_candidates(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("api_style", &self.api_style)
            .field("candidates", &self.candidates)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window of the backend, in tokens
    #[serde(default = "default_max_context")]
    pub max_context: usize,

    /// Tokens reserved for the response
    #[serde(default = "default_max_response")]
    pub max_response: usize,

    /// Safety margin for tokenizer inaccuracy
    #[serde(default = "default_token_padding")]
    pub token_padding: usize,

    /// Always include every example dialogue, shrinking the history budget
    #[serde(default)]
    pub pin_examples: bool,

    #[serde(default = "default_example_separator")]
    pub example_separator: String,

    /// Marker placed before the first history turn
    #[serde(default)]
    pub chat_start: String,
}

fn default_max_context() -> usize {
    8192
}
fn default_max_response() -> usize {
    512
}
fn default_token_padding() -> usize {
    64
}
fn default_example_separator() -> String {
    "***".into()
}

impl ContextConfig {
    /// The packing ceiling: context minus response reserve minus padding.
    pub fn ceiling(&self) -> usize {
        self.max_context
            .saturating_sub(self.max_response)
            .saturating_sub(self.token_padding)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
            max_response: default_max_response(),
            token_padding: default_token_padding(),
            pin_examples: false,
            example_separator: default_example_separator(),
            chat_start: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Collapse runs of blank lines into a single newline
    #[serde(default)]
    pub collapse_newlines: bool,

    /// Cut final output back to the last complete sentence
    #[serde(default)]
    pub trim_sentences: bool,

    /// Trim surrounding whitespace
    #[serde(default = "default_true")]
    pub trim_spaces: bool,

    /// Strip the speaker's own `Name:` prefix
    #[serde(default = "default_true")]
    pub trim_names: bool,

    /// Extra stop strings
    #[serde(default)]
    pub custom_stop_strings: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            collapse_newlines: false,
            trim_sentences: false,
            trim_spaces: true,
            trim_names: true,
            custom_stop_strings: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_input_sequence")]
    pub input_sequence: String,

    #[serde(default = "default_output_sequence")]
    pub output_sequence: String,

    #[serde(default)]
    pub system_sequence: String,

    #[serde(default)]
    pub stop_sequence: String,
}

fn default_input_sequence() -> String {
    "### Instruction:".into()
}
fn default_output_sequence() -> String {
    "### Response:".into()
}

impl InstructConfig {
    /// All non-empty sequences, in template order.
    pub fn sequences(&self) -> Vec<String> {
        [
            &self.input_sequence,
            &self.output_sequence,
            &self.system_sequence,
            &self.stop_sequence,
        ]
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .collect()
    }
}

impl Default for InstructConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            input_sequence: default_input_sequence(),
            output_sequence: default_output_sequence(),
            system_sequence: String::new(),
            stop_sequence: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Split a leading reasoning block from the display text
    #[serde(default = "default_true")]
    pub auto_parse: bool,

    #[serde(default = "default_reasoning_prefix")]
    pub prefix: String,

    #[serde(default = "default_reasoning_suffix")]
    pub suffix: String,
}

fn default_reasoning_prefix() -> String {
    "<think>".into()
}
fn default_reasoning_suffix() -> String {
    "</think>".into()
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            auto_parse: true,
            prefix: default_reasoning_prefix(),
            suffix: default_reasoning_suffix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// Byte-length estimate
    Heuristic,
    /// A `tokenizer.json` loaded with the `tokenizers` crate
    Hf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_tokenizer_kind")]
    pub kind: TokenizerKind,

    #[serde(default = "default_bytes_per_token")]
    pub bytes_per_token: f32,

    /// Path to `tokenizer.json` when `kind = "hf"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_tokenizer_kind() -> TokenizerKind {
    TokenizerKind::Heuristic
}
fn default_bytes_per_token() -> f32 {
    4.0
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: default_tokenizer_kind(),
            bytes_per_token: default_bytes_per_token(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamesConfig {
    #[serde(default = "default_user_name")]
    pub user: String,

    #[serde(default = "default_character_name")]
    pub character: String,
}

fn default_user_name() -> String {
    "User".into()
}
fn default_character_name() -> String {
    "Assistant".into()
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            user: default_user_name(),
            character: default_character_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatweave/config.toml).
    ///
    /// Environment variables override the file:
    /// - `CHATWEAVE_API_KEY` (then `OPENAI_API_KEY`)
    /// - `CHATWEAVE_API_URL`
    /// - `CHATWEAVE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.backend.api_key.is_none() {
            config.backend.api_key = std::env::var("CHATWEAVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(url) = std::env::var("CHATWEAVE_API_URL") {
            config.backend.api_url = url;
        }

        if let Ok(model) = std::env::var("CHATWEAVE_MODEL") {
            config.backend.model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.temperature < 0.0 || self.backend.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "backend.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.backend.candidates == 0 {
            return Err(ConfigError::ValidationError(
                "backend.candidates must be at least 1".into(),
            ));
        }

        if self.context.ceiling() == 0 {
            return Err(ConfigError::ValidationError(format!(
                "context.max_context ({}) leaves no room after max_response ({}) and token_padding ({})",
                self.context.max_context, self.context.max_response, self.context.token_padding
            )));
        }

        if self.reasoning.auto_parse
            && (self.reasoning.prefix.is_empty() || self.reasoning.suffix.is_empty())
        {
            return Err(ConfigError::ValidationError(
                "reasoning.prefix and reasoning.suffix must be set when auto_parse is on".into(),
            ));
        }

        if !(self.tokenizer.bytes_per_token > 0.0) {
            return Err(ConfigError::ValidationError(
                "tokenizer.bytes_per_token must be > 0".into(),
            ));
        }

        if self.tokenizer.kind == TokenizerKind::Hf && self.tokenizer.path.is_none() {
            return Err(ConfigError::ValidationError(
                "tokenizer.path is required when tokenizer.kind = \"hf\"".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.backend.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.context.max_context, 8192);
        assert_eq!(config.backend.api_style, ApiStyle::Chat);
    }

    #[test]
    fn ceiling_subtracts_response_and_padding() {
        let ctx = ContextConfig {
            max_context: 4096,
            max_response: 300,
            token_padding: 64,
            ..ContextConfig::default()
        };
        assert_eq!(ctx.ceiling(), 3732);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.backend.model, config.backend.model);
        assert_eq!(parsed.context.max_context, config.context.max_context);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            backend: BackendConfig {
                temperature: 5.0,
                ..BackendConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn response_reserve_larger_than_context_rejected() {
        let config = AppConfig {
            context: ContextConfig {
                max_context: 512,
                max_response: 1024,
                ..ContextConfig::default()
            },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("leaves no room"));
    }

    #[test]
    fn hf_tokenizer_requires_path() {
        let config = AppConfig {
            tokenizer: TokenizerConfig {
                kind: TokenizerKind::Hf,
                ..TokenizerConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.names.user, "User");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[context]
max_context = 2048
pin_examples = true

[output]
custom_stop_strings = ["<END>"]

[names]
user = "Sam"
character = "Aria"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.context.max_context, 2048);
        assert!(config.context.pin_examples);
        assert_eq!(config.context.max_response, 512);
        assert_eq!(config.output.custom_stop_strings, vec!["<END>".to_string()]);
        assert!(config.output.trim_spaces);
        assert_eq!(config.names.character, "Aria");
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[context\nmax_context = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn api_key_redacted_in_debug() {
        let backend = BackendConfig {
            api_key: Some("sk-secret".into()),
            ..BackendConfig::default()
        };
        let debug = format!("{backend:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn instruct_sequences_skip_empty() {
        let instruct = InstructConfig::default();
        assert_eq!(
            instruct.sequences(),
            vec!["### Instruction:".to_string(), "### Response:".to_string()]
        );
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("max_context"));
        assert!(toml_str.contains("gpt-4o-mini"));
    }
}
