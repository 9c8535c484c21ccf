pub mod bridge;
pub mod conversation;
pub mod events;
pub mod handle;
pub mod manager;
pub mod media;
pub mod participant;

#[cfg(test)]
mod tests;

pub use bridge::BridgeMixer;
pub use conversation::{AutoHoldMode, Conversation};
pub use events::ConversationEvent;
pub use handle::{ConversationHandle, HandleAllocator, ParticipantHandle};
pub use manager::{ConversationManager, ConversationManagerHandle};
pub use media::{MediaResourceCache, MediaUrl};
pub use participant::{ForkSelectMode, Participant, ParticipantKind};
