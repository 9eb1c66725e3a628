//! Prompt assembly under a token ceiling.
//!
//! | Class | Source | Eviction |
//! |-------|--------|----------|
//! | Pinned | Story, injections, chat start, cue | Never; overflow is an error |
//! | History | Chat turns | Oldest dropped first |
//! | Examples | Example dialogue | Dropped before any history turn |

pub mod injection;
pub mod packer;
pub mod token;

pub use injection::{
    DepthInjection, Injection, InjectionPosition, InjectionRegistry, Predicate,
    ResolvedInjections, predicate,
};
pub use packer::{
    DropInfo, Evictability, HistoryTurn, LayerStats, PackInput, PackMetadata, PackOptions,
    PackedPrompt, PromptPacker, PromptTail, Segment, SegmentKind, TurnFormat,
};
pub use token::TokenCounter;
