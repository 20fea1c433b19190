pub mod call;
pub mod conversation;
pub mod draft;
pub mod message;
pub mod participant;

pub use call::{CallKind, CallRecord, CallStatus};
pub use conversation::{direct_key, Conversation, ConversationKind, ConversationSettings};
pub use draft::Draft;
pub use message::{
    Attachment, EditRecord, Message, MessageKind, MessageMeta, MessageStatus, Reaction,
    ReactionAction,
};
pub use participant::{Participant, ParticipantRole, ParticipantStatus};
