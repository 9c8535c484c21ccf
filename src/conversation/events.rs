use super::handle::{ConversationHandle, ParticipantHandle};
use tokio::sync::mpsc::UnboundedSender;

/// Everything the conversation manager reports to the application, in
/// per-participant order, over the application's FIFO.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// A remote party is calling us; add the participant to a
    /// conversation and answer, reject, or redirect it.
    IncomingParticipant {
        participant: ParticipantHandle,
        from: String,
    },
    /// A connected peer sent REFER: it wants us to place a call to
    /// `target`. The application dials with `create_remote_participant`
    /// if it agrees.
    RequestOutgoingParticipant {
        referred_by: ParticipantHandle,
        target: String,
    },
    /// The outbound INVITE left the building (first provisional seen).
    ParticipantProceeding {
        participant: ParticipantHandle,
        code: u16,
    },
    ParticipantAlerting {
        participant: ParticipantHandle,
        early_media: bool,
    },
    ParticipantConnected {
        participant: ParticipantHandle,
    },
    /// ACK arrived for a call we answered.
    ParticipantConnectedConfirmed {
        participant: ParticipantHandle,
    },
    ParticipantTerminated {
        participant: ParticipantHandle,
        status_code: u16,
    },
    ParticipantDestroyed {
        participant: ParticipantHandle,
    },
    ConversationDestroyed {
        conversation: ConversationHandle,
    },
    /// An outbound call forked; a sibling conversation/participant pair
    /// now tracks the extra early dialog.
    RelatedConversation {
        related_conversation: ConversationHandle,
        related_participant: ParticipantHandle,
        original_conversation: ConversationHandle,
        original_participant: ParticipantHandle,
    },
    ParticipantRequestedHold {
        participant: ParticipantHandle,
        held: bool,
    },
    ParticipantRedirectSuccess {
        participant: ParticipantHandle,
    },
    ParticipantRedirectFailure {
        participant: ParticipantHandle,
        status_code: u16,
    },
    DtmfEvent {
        participant: ParticipantHandle,
        digit: char,
        duration_ms: u32,
        up: bool,
    },
    /// Playback or recording finished on a media participant.
    MediaResourceDone {
        participant: ParticipantHandle,
    },
    /// A media participant could not be started (bad media URL, missing
    /// cache entry, unknown conversation). The handle was never
    /// registered; there is nothing to destroy.
    MediaResourceFailed {
        participant: ParticipantHandle,
        error: String,
    },
    ApplicationTimer {
        id: u32,
        data1: u32,
        data2: u32,
    },
}

pub type ConversationEventSender = UnboundedSender<ConversationEvent>;
