//! Conversation context assembly.

pub mod context;

pub use context::{ContextAssembler, ConversationMessage, Role};
