pub mod listener;
pub mod service;

pub use listener::{ConversationListener, EmptyConversationListener};
pub use service::{ConversationPhase, ConversationSyncer};
