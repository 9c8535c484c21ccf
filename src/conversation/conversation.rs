use super::bridge::MediaInterfaceId;
use super::handle::{ConversationHandle, ParticipantHandle};

/// Hold policy applied per conversation as membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoHoldMode {
    /// Only `hold_participant` changes hold state.
    Disabled,
    /// A remote participant alone in its conversation is put on hold
    /// and resumed when someone joins.
    #[default]
    Enabled,
    /// Every remote participant stays held with sendonly media; inbound
    /// inactive offers are answered sendonly. The music-on-hold server
    /// pattern.
    BroadcastOnly,
}

/// Per-membership mixing contribution, 0..=100 each way.
#[derive(Debug, Clone, Copy)]
pub struct Contribution {
    pub input_gain: u32,
    pub output_gain: u32,
}

impl Default for Contribution {
    fn default() -> Self {
        Contribution {
            input_gain: 100,
            output_gain: 100,
        }
    }
}

pub struct Member {
    pub handle: ParticipantHandle,
    pub contribution: Contribution,
}

/// An ordered set of participants mixed together. Conversations that
/// fork off an outbound call share the original's media interface so
/// the winning fork can be moved without renegotiation.
pub struct Conversation {
    pub handle: ConversationHandle,
    pub auto_hold: AutoHoldMode,
    pub media_interface: MediaInterfaceId,
    /// the conversation this one was created as a fork sibling of
    pub related_to: Option<ConversationHandle>,
    members: Vec<Member>,
}

impl Conversation {
    pub fn new(
        handle: ConversationHandle,
        auto_hold: AutoHoldMode,
        media_interface: MediaInterfaceId,
    ) -> Self {
        Conversation {
            handle,
            auto_hold,
            media_interface,
            related_to: None,
            members: Vec::new(),
        }
    }

    pub fn add_member(&mut self, handle: ParticipantHandle) -> bool {
        if self.contains(handle) {
            return false;
        }
        self.members.push(Member {
            handle,
            contribution: Contribution::default(),
        });
        true
    }

    pub fn remove_member(&mut self, handle: ParticipantHandle) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.handle != handle);
        self.members.len() != before
    }

    pub fn contains(&self, handle: ParticipantHandle) -> bool {
        self.members.iter().any(|m| m.handle == handle)
    }

    pub fn member_handles(&self) -> Vec<ParticipantHandle> {
        self.members.iter().map(|m| m.handle).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn set_contribution(
        &mut self,
        handle: ParticipantHandle,
        input_gain: u32,
        output_gain: u32,
    ) -> bool {
        match self.members.iter_mut().find(|m| m.handle == handle) {
            Some(member) => {
                member.contribution = Contribution {
                    input_gain: input_gain.min(100),
                    output_gain: output_gain.min(100),
                };
                true
            }
            None => false,
        }
    }

    pub fn contribution(&self, handle: ParticipantHandle) -> Option<Contribution> {
        self.members
            .iter()
            .find(|m| m.handle == handle)
            .map(|m| m.contribution)
    }

    /// True when `handle` is the only member, the condition that
    /// triggers auto-hold.
    pub fn is_sole_member(&self, handle: ParticipantHandle) -> bool {
        self.members.len() == 1 && self.members[0].handle == handle
    }

    pub fn drain_members(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.members)
    }
}
