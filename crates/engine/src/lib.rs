//! Prompt assembly and streaming generation for ChatWeave.
//!
//! A generation runs in four steps:
//!
//! 1. **Resolve** injections registered by extensions and prompt managers
//! 2. **Pack** story, examples and history under the token ceiling
//! 3. **Stream** chunks from the transport into a [`GenerationSession`]
//! 4. **Commit** the normalized text to the chat history exactly once
//!
//! Cancellation, transport errors and channel closure all end in a
//! terminal [`SessionOutcome`]; the history never sees a half-applied write.

pub mod context;
pub mod conversation;
pub mod output;
pub mod session;

pub use context::{
    InjectionPosition, InjectionRegistry, PackInput, PackMetadata, PackOptions, PackedPrompt,
    PromptPacker, PromptTail, TokenCounter,
};
pub use conversation::ConversationContext;
pub use output::{NormalizeOptions, OutputNormalizer, ReasoningParser, StopStringBuilder};
pub use session::{GenerationResult, GenerationSession, SessionDeps, SessionOutcome};
