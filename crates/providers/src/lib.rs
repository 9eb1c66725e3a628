//! Transport implementations for chatweave.
//!
//! All transports implement the `chatweave_core::Transport` trait and yield
//! cumulative chunks: every chunk carries the full text generated so far.

pub mod openai_compat;
pub mod scripted;

pub use openai_compat::{MAX_STOP_STRINGS, OpenAiCompatTransport};
pub use scripted::ScriptedTransport;
