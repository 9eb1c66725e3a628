//! Token counting with caching and a conservative fallback.
//!
//! Every count in the engine goes through [`TokenCounter`]. When the
//! configured tokenizer fails, the counter falls back to the byte-length
//! estimate (~4 bytes per token, rounded up), logs once, and carries on.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chatweave_config::{TokenizerConfig, TokenizerKind};
use chatweave_core::error::TokenizerError;
use chatweave_core::tokenizer::{HeuristicTokenizer, Tokenizer, estimate_tokens};
use tracing::warn;

/// Cached counts kept before the cache is cleared.
const CACHE_CAPACITY: usize = 4096;

pub struct TokenCounter {
    tokenizer: Arc<dyn Tokenizer>,
    cache: Mutex<HashMap<u64, usize>>,
    fallback_logged: AtomicBool,
}

impl TokenCounter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            cache: Mutex::new(HashMap::new()),
            fallback_logged: AtomicBool::new(false),
        }
    }

    /// A counter backed by the default byte-length heuristic.
    pub fn heuristic() -> Self {
        Self::new(Arc::new(HeuristicTokenizer::default()))
    }

    /// Build the counter selected by configuration.
    ///
    /// An `hf` tokenizer that cannot be loaded (or a build without the `hf`
    /// feature) degrades to the heuristic with a warning.
    pub fn from_config(config: &TokenizerConfig) -> Self {
        match config.kind {
            TokenizerKind::Heuristic => {
                Self::new(Arc::new(HeuristicTokenizer::new(config.bytes_per_token)))
            }
            TokenizerKind::Hf => match load_hf(config.path.as_deref()) {
                Ok(tokenizer) => Self::new(tokenizer),
                Err(e) => {
                    warn!(error = %e, "Falling back to heuristic token counting");
                    Self::new(Arc::new(HeuristicTokenizer::new(config.bytes_per_token)))
                }
            },
        }
    }

    pub fn tokenizer_name(&self) -> &str {
        self.tokenizer.name()
    }

    /// Count tokens in `text`. Never fails.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let key = hash_text(text);
        if let Some(hit) = self.cache_get(key) {
            return hit;
        }
        let tokens = match self.tokenizer.count(text) {
            Ok(n) => n,
            Err(e) => self.fallback(text, &e),
        };
        self.cache_put(key, tokens);
        tokens
    }

    /// Number of cached entries.
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn fallback(&self, text: &str, error: &TokenizerError) -> usize {
        if !self.fallback_logged.swap(true, Ordering::Relaxed) {
            warn!(
                tokenizer = self.tokenizer.name(),
                error = %error,
                "Tokenizer unavailable, using length-based estimate"
            );
        }
        estimate_tokens(text)
    }

    fn cache_get(&self, key: u64) -> Option<usize> {
        self.cache.lock().ok().and_then(|c| c.get(&key).copied())
    }

    fn cache_put(&self, key: u64, tokens: usize) {
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert(key, tokens);
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("tokenizer", &self.tokenizer.name())
            .field("cached", &self.cached())
            .finish()
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(feature = "hf")]
fn load_hf(path: Option<&str>) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
    let path = path.ok_or_else(|| TokenizerError::Unavailable("no tokenizer path".into()))?;
    Ok(Arc::new(HfTokenizer::from_file(path)?))
}

#[cfg(not(feature = "hf"))]
fn load_hf(_path: Option<&str>) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
    Err(TokenizerError::Unavailable(
        "built without the `hf` feature".into(),
    ))
}

/// A tokenizer backed by a Hugging Face `tokenizer.json`.
#[cfg(feature = "hf")]
pub struct HfTokenizer {
    name: String,
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf")]
impl HfTokenizer {
    pub fn from_file(path: &str) -> Result<Self, TokenizerError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| TokenizerError::Unavailable(format!("{path}: {e}")))?;
        Ok(Self {
            name: format!("hf:{path}"),
            inner,
        })
    }
}

#[cfg(feature = "hf")]
#[async_trait::async_trait]
impl Tokenizer for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, text: &str) -> Result<usize, TokenizerError> {
        self.inner
            .encode(text, false)
            .map(|encoding| encoding.len())
            .map_err(|e| TokenizerError::Unavailable(e.to_string()))
    }
}
