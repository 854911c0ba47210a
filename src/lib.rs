//! Nepex chat core: conversation, settings, user and activity stores over a pluggable
//! key-value slot store, plus the AI gateway and the chat session that drives it.

pub mod activity;
pub mod ai;
pub mod chat;
pub mod clock;
pub mod command;
pub mod config;
pub mod conversations;
pub mod error;
pub mod latch;
pub mod prompts;
pub mod session;
pub mod settings;
pub mod storage;
pub mod types;
pub mod users;

pub use chat::{ChatSession, GenerationOutcome};
pub use error::{ChatError, ChatResult};
