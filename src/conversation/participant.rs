use super::handle::{ConversationHandle, ParticipantHandle};
use super::media::MediaUrl;
use crate::dialog::{session::InviteSession, DialogId};
use std::collections::HashSet;

/// Fork handling for an outbound remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkSelectMode {
    /// Accept the first fork that answers; BYE the other confirmed
    /// forks. No CANCEL is issued; a late 2xx on a losing fork is
    /// confirmed and immediately released.
    #[default]
    Automatic,
    /// Like `Automatic`, and destroying the original participant before
    /// any answer issues one CANCEL and tears down every related
    /// conversation.
    AutomaticEx,
    /// The application disposes of forks itself.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Connecting,
    Alerting,
    Connected,
    Terminating,
}

/// State of a remote participant's SIP leg.
pub struct RemoteParticipant {
    pub session: InviteSession,
    pub dialog_id: DialogId,
    pub fork_mode: ForkSelectMode,
    pub state: RemoteState,
    pub held: bool,
    /// the participant this one forked from, if any
    pub fork_of: Option<ParticipantHandle>,
    pub incoming: bool,
}

pub struct MediaResourceParticipant {
    pub url: MediaUrl,
}

pub enum ParticipantKind {
    /// Microphone and speaker of the local host; at most one exists.
    Local,
    Remote(Box<RemoteParticipant>),
    MediaResource(MediaResourceParticipant),
}

/// A member of zero or more conversations. The cascading rule lives in
/// the manager: a remote participant whose membership set becomes empty
/// is destroyed and its session released with BYE.
pub struct Participant {
    pub handle: ParticipantHandle,
    pub kind: ParticipantKind,
    pub conversations: HashSet<ConversationHandle>,
    /// set once teardown has begun so destroy stays idempotent and only
    /// one BYE is ever sent
    pub terminating: bool,
}

impl Participant {
    pub fn new(handle: ParticipantHandle, kind: ParticipantKind) -> Self {
        Participant {
            handle,
            kind,
            conversations: HashSet::new(),
            terminating: false,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, ParticipantKind::Remote(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ParticipantKind::Local)
    }

    pub fn remote(&self) -> Option<&RemoteParticipant> {
        match &self.kind {
            ParticipantKind::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn remote_mut(&mut self) -> Option<&mut RemoteParticipant> {
        match &mut self.kind {
            ParticipantKind::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}
