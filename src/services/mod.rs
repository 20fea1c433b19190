pub mod conversation_service;
pub mod sweeper;

pub use conversation_service::{ConversationService, OutgoingMessage, ServiceLimits};
