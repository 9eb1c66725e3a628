//! # chatweave core
//!
//! Domain types, traits, and error definitions for the chatweave generation
//! engine. This crate carries no engine logic: it defines the vocabulary the
//! packer, the streaming session and the transports agree on.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here (tokenizer, transport,
//! session observer). Implementations live in their respective crates, so
//! tests can swap in scripted or heuristic stand-ins.

pub mod busy;
pub mod error;
pub mod event;
pub mod message;
pub mod tokenizer;
pub mod transport;

// Re-export key types at crate root for ergonomics
pub use busy::{BusyFlag, BusyGuard};
pub use error::{Error, PackError, Result, SessionError, SwipeError, TokenizerError, TransportError};
pub use event::{GenerationType, ObserverRegistry, SessionEvent, SessionObserver, SessionState};
pub use message::{ChatHistory, Message, MessageExtra, Role, SwipeInfo, ToolInvocation};
pub use tokenizer::{HeuristicTokenizer, Tokenizer};
pub use transport::{
    ChatTurn, ChunkReceiver, ChunkState, GenerationRequest, PromptPayload, Transport,
    TransportChunk,
};
