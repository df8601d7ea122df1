//! 记忆层：对话窗口与持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{ConversationWindow, Message, Role, Turn};
pub use persistence::ConversationPersistence;
