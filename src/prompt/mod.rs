//! # Prompt Module
//!
//! Conversation history: threads owned by a user, tagged for retrieval, with
//! messages kept in arrival order.

mod store;
mod types;

pub use store::PromptStore;
pub use types::{Conversation, ConversationWithMessages, Message, Role};

pub(crate) use store::{get_conversation_in, get_messages_in, list_by_tag_in, list_by_user_in};
