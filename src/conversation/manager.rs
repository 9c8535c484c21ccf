use super::{
    bridge::{BridgeMixer, MediaInterfaceId},
    conversation::{AutoHoldMode, Conversation},
    events::{ConversationEvent, ConversationEventSender},
    handle::{ConversationHandle, HandleAllocator, ParticipantHandle},
    media::{CodecTag, MediaResourceCache, MediaSource, MediaUrl},
    participant::{
        ForkSelectMode, MediaResourceParticipant, Participant, ParticipantKind,
        RemoteParticipant, RemoteState,
    },
};
use crate::{
    dialog::{
        authenticate::Credential,
        dialog_layer::DialogLayer,
        invitation::InviteOption,
        session::{SessionEvent, SessionState, TerminatedReason},
        DialogId,
    },
    sdp::{self, MediaDirection},
    Error, Result,
};
use bytes::Bytes;
use rsip::StatusCode;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, info, warn};

/// Identity and media material used for every leg this manager places or
/// answers. The session description is the engine's template; direction
/// attributes are rewritten per hold state.
#[derive(Clone)]
pub struct ConversationProfile {
    pub aor: rsip::Uri,
    pub contact: rsip::Uri,
    pub session_description: Vec<u8>,
    pub credential: Option<Credential>,
}

enum Command {
    CreateConversation {
        handle: ConversationHandle,
        mode: AutoHoldMode,
    },
    DestroyConversation {
        handle: ConversationHandle,
    },
    JoinConversation {
        source: ConversationHandle,
        dest: ConversationHandle,
    },
    CreateRemoteParticipant {
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        destination: rsip::Uri,
        fork_mode: ForkSelectMode,
        headers: Option<Vec<rsip::Header>>,
    },
    CreateMediaParticipant {
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        url: String,
    },
    CreateLocalParticipant {
        participant: ParticipantHandle,
    },
    DestroyParticipant {
        participant: ParticipantHandle,
    },
    /// internal: tear down a fork sibling without sending anything; the
    /// original's CANCEL covers the whole fork set
    DestroyParticipantQuiet {
        participant: ParticipantHandle,
    },
    AddParticipant {
        conversation: ConversationHandle,
        participant: ParticipantHandle,
    },
    RemoveParticipant {
        conversation: ConversationHandle,
        participant: ParticipantHandle,
    },
    MoveParticipant {
        participant: ParticipantHandle,
        source: ConversationHandle,
        dest: ConversationHandle,
    },
    ModifyContribution {
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        input_gain: u32,
        output_gain: u32,
    },
    OutputBridgeMatrix {
        reply: oneshot::Sender<String>,
    },
    AlertParticipant {
        participant: ParticipantHandle,
        early_media: bool,
    },
    AnswerParticipant {
        participant: ParticipantHandle,
    },
    RejectParticipant {
        participant: ParticipantHandle,
        code: u16,
    },
    RedirectParticipant {
        participant: ParticipantHandle,
        destination: rsip::Uri,
    },
    RedirectToParticipant {
        participant: ParticipantHandle,
        target: ParticipantHandle,
    },
    HoldParticipant {
        participant: ParticipantHandle,
        hold: bool,
    },
    AddCacheBuffer {
        name: String,
        data: Bytes,
        codec: CodecTag,
    },
    StartTimer {
        id: u32,
        data1: u32,
        data2: u32,
        duration: Duration,
    },
    TimerFired {
        id: u32,
        data1: u32,
        data2: u32,
    },
    QueryConversation {
        handle: ConversationHandle,
        reply: oneshot::Sender<Option<Vec<ParticipantHandle>>>,
    },
    QueryParticipant {
        handle: ParticipantHandle,
        reply: oneshot::Sender<Option<Vec<ConversationHandle>>>,
    },
    Shutdown,
}

/// Cloneable, thread-safe face of the manager. Handles are minted
/// immediately under the allocator's mutex; the mutation itself is
/// enqueued to the manager task, so any thread may call any method.
#[derive(Clone)]
pub struct ConversationManagerHandle {
    allocator: Arc<HandleAllocator>,
    commands: UnboundedSender<Command>,
}

impl ConversationManagerHandle {
    pub fn create_conversation(&self, mode: AutoHoldMode) -> ConversationHandle {
        let handle = self.allocator.conversation();
        self.commands
            .send(Command::CreateConversation { handle, mode })
            .ok();
        handle
    }

    pub fn destroy_conversation(&self, handle: ConversationHandle) {
        self.commands
            .send(Command::DestroyConversation { handle })
            .ok();
    }

    pub fn join_conversation(&self, source: ConversationHandle, dest: ConversationHandle) {
        self.commands
            .send(Command::JoinConversation { source, dest })
            .ok();
    }

    pub fn create_remote_participant(
        &self,
        conversation: ConversationHandle,
        destination: rsip::Uri,
        fork_mode: ForkSelectMode,
    ) -> ParticipantHandle {
        self.create_remote_participant_with(conversation, destination, fork_mode, None)
    }

    pub fn create_remote_participant_with(
        &self,
        conversation: ConversationHandle,
        destination: rsip::Uri,
        fork_mode: ForkSelectMode,
        headers: Option<Vec<rsip::Header>>,
    ) -> ParticipantHandle {
        let participant = self.allocator.participant();
        self.commands
            .send(Command::CreateRemoteParticipant {
                conversation,
                participant,
                destination,
                fork_mode,
                headers,
            })
            .ok();
        participant
    }

    pub fn create_media_participant(
        &self,
        conversation: ConversationHandle,
        url: &str,
    ) -> ParticipantHandle {
        let participant = self.allocator.participant();
        self.commands
            .send(Command::CreateMediaParticipant {
                conversation,
                participant,
                url: url.to_string(),
            })
            .ok();
        participant
    }

    pub fn create_local_participant(&self) -> ParticipantHandle {
        let participant = self.allocator.participant();
        self.commands
            .send(Command::CreateLocalParticipant { participant })
            .ok();
        participant
    }

    pub fn destroy_participant(&self, participant: ParticipantHandle) {
        self.commands
            .send(Command::DestroyParticipant { participant })
            .ok();
    }

    pub fn add_participant(
        &self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
    ) {
        self.commands
            .send(Command::AddParticipant {
                conversation,
                participant,
            })
            .ok();
    }

    pub fn remove_participant(
        &self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
    ) {
        self.commands
            .send(Command::RemoveParticipant {
                conversation,
                participant,
            })
            .ok();
    }

    pub fn move_participant(
        &self,
        participant: ParticipantHandle,
        source: ConversationHandle,
        dest: ConversationHandle,
    ) {
        self.commands
            .send(Command::MoveParticipant {
                participant,
                source,
                dest,
            })
            .ok();
    }

    pub fn modify_participant_contribution(
        &self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        input_gain: u32,
        output_gain: u32,
    ) {
        self.commands
            .send(Command::ModifyContribution {
                conversation,
                participant,
                input_gain,
                output_gain,
            })
            .ok();
    }

    /// Render the current mixing matrix, rows labelled by participant
    /// handle.
    pub async fn output_bridge_matrix(&self) -> String {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::OutputBridgeMatrix { reply })
            .is_err()
        {
            return String::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn alert_participant(&self, participant: ParticipantHandle, early_media: bool) {
        self.commands
            .send(Command::AlertParticipant {
                participant,
                early_media,
            })
            .ok();
    }

    pub fn answer_participant(&self, participant: ParticipantHandle) {
        self.commands
            .send(Command::AnswerParticipant { participant })
            .ok();
    }

    pub fn reject_participant(&self, participant: ParticipantHandle, code: u16) {
        self.commands
            .send(Command::RejectParticipant { participant, code })
            .ok();
    }

    pub fn redirect_participant(&self, participant: ParticipantHandle, destination: rsip::Uri) {
        self.commands
            .send(Command::RedirectParticipant {
                participant,
                destination,
            })
            .ok();
    }

    pub fn redirect_to_participant(
        &self,
        participant: ParticipantHandle,
        target: ParticipantHandle,
    ) {
        self.commands
            .send(Command::RedirectToParticipant {
                participant,
                target,
            })
            .ok();
    }

    pub fn hold_participant(&self, participant: ParticipantHandle, hold: bool) {
        self.commands
            .send(Command::HoldParticipant { participant, hold })
            .ok();
    }

    pub fn add_buffer_to_cache(&self, name: &str, data: Bytes, codec: CodecTag) {
        self.commands
            .send(Command::AddCacheBuffer {
                name: name.to_string(),
                data,
                codec,
            })
            .ok();
    }

    /// Coarse one-shot timer; cannot be cancelled. Fires an
    /// `ApplicationTimer` event carrying the same three values.
    pub fn start_application_timer(&self, id: u32, data1: u32, data2: u32, duration: Duration) {
        self.commands
            .send(Command::StartTimer {
                id,
                data1,
                data2,
                duration,
            })
            .ok();
    }

    /// Members of a conversation, or `None` when the handle is stale or
    /// unknown.
    pub async fn conversation_members(
        &self,
        handle: ConversationHandle,
    ) -> Option<Vec<ParticipantHandle>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::QueryConversation { handle, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Conversations a participant belongs to, or `None` for a stale or
    /// unknown handle.
    pub async fn participant_conversations(
        &self,
        handle: ParticipantHandle,
    ) -> Option<Vec<ConversationHandle>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::QueryParticipant { handle, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn shutdown(&self) {
        self.commands.send(Command::Shutdown).ok();
    }
}

/// The conversation engine. Owns the handle registries, fork policy,
/// auto-hold policy, media resources, and the bridge mixer; runs as a
/// single task so every mutation is serialized.
pub struct ConversationManager {
    allocator: Arc<HandleAllocator>,
    commands: UnboundedReceiver<Command>,
    command_sender: UnboundedSender<Command>,
    session_events: UnboundedReceiver<(DialogId, SessionEvent)>,

    dialog_layer: Arc<DialogLayer>,
    profile: ConversationProfile,
    app_events: ConversationEventSender,

    conversations: HashMap<ConversationHandle, Conversation>,
    participants: HashMap<ParticipantHandle, Participant>,
    by_dialog: HashMap<DialogId, ParticipantHandle>,
    local_participant: Option<ParticipantHandle>,
    mixer: BridgeMixer,
    cache: MediaResourceCache,
    next_interface: u64,
    shutting_down: bool,
}

impl ConversationManager {
    pub fn new(
        dialog_layer: Arc<DialogLayer>,
        profile: ConversationProfile,
        app_events: ConversationEventSender,
    ) -> (ConversationManagerHandle, Self) {
        let (command_sender, commands) = unbounded_channel();
        let (session_sender, session_events) = unbounded_channel();
        dialog_layer.set_event_sender(session_sender);

        let allocator = Arc::new(HandleAllocator::new());
        let handle = ConversationManagerHandle {
            allocator: allocator.clone(),
            commands: command_sender.clone(),
        };
        let manager = ConversationManager {
            allocator,
            commands,
            command_sender,
            session_events,
            dialog_layer,
            profile,
            app_events,
            conversations: HashMap::new(),
            participants: HashMap::new(),
            by_dialog: HashMap::new(),
            local_participant: None,
            mixer: BridgeMixer::new(),
            cache: MediaResourceCache::new(),
            next_interface: 1,
            shutting_down: false,
        };
        (handle, manager)
    }

    /// Drive commands and session events until shutdown.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            self.on_shutdown().await;
                            break;
                        }
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                event = self.session_events.recv() => {
                    if let Some((id, event)) = event {
                        self.on_session_event(id, event).await;
                    }
                }
            }
        }
    }

    fn emit(&self, event: ConversationEvent) {
        self.app_events.send(event).ok();
    }

    /// Resolve a dialog to its participant. The original outbound leg is
    /// registered before any remote tag exists; the first event carrying
    /// the confirmed id promotes the mapping in place.
    fn participant_for(&mut self, id: &DialogId) -> Option<ParticipantHandle> {
        if let Some(handle) = self.by_dialog.get(id) {
            return Some(*handle);
        }
        let early = DialogId {
            call_id: id.call_id.clone(),
            from_tag: id.from_tag.clone(),
            to_tag: String::new(),
        };
        if let Some(handle) = self.by_dialog.remove(&early) {
            self.by_dialog.insert(id.clone(), handle);
            if let Some(remote) = self
                .participants
                .get_mut(&handle)
                .and_then(|p| p.remote_mut())
            {
                remote.dialog_id = id.clone();
            }
            return Some(handle);
        }
        None
    }

    fn next_media_interface(&mut self) -> MediaInterfaceId {
        let id = MediaInterfaceId(self.next_interface);
        self.next_interface += 1;
        id
    }

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateConversation { handle, mode } => {
                let interface = self.next_media_interface();
                self.conversations
                    .insert(handle, Conversation::new(handle, mode, interface));
                debug!("created {}", handle);
            }
            Command::DestroyConversation { handle } => {
                self.destroy_conversation(handle).await;
            }
            Command::JoinConversation { source, dest } => {
                self.join_conversation(source, dest).await;
            }
            Command::CreateRemoteParticipant {
                conversation,
                participant,
                destination,
                fork_mode,
                headers,
            } => {
                if let Err(e) = self
                    .create_remote_participant(conversation, participant, destination, fork_mode, headers)
                    .await
                {
                    warn!("failed to create remote participant: {}", e);
                    self.emit(ConversationEvent::ParticipantTerminated {
                        participant,
                        status_code: 500,
                    });
                }
            }
            Command::CreateMediaParticipant {
                conversation,
                participant,
                url,
            } => {
                if let Err(e) = self.create_media_participant(conversation, participant, &url) {
                    warn!("failed to create media participant: {}", e);
                    self.emit(ConversationEvent::MediaResourceFailed {
                        participant,
                        error: e.to_string(),
                    });
                }
            }
            Command::CreateLocalParticipant { participant } => {
                // the engine supports a single microphone/speaker pair
                if self.local_participant.is_some() {
                    warn!("local participant already exists");
                    return;
                }
                self.participants
                    .insert(participant, Participant::new(participant, ParticipantKind::Local));
                self.local_participant = Some(participant);
            }
            Command::DestroyParticipant { participant } => {
                self.destroy_participant(participant, true).await;
            }
            Command::DestroyParticipantQuiet { participant } => {
                self.destroy_participant(participant, false).await;
            }
            Command::AddParticipant {
                conversation,
                participant,
            } => {
                self.add_participant(conversation, participant).await;
            }
            Command::RemoveParticipant {
                conversation,
                participant,
            } => {
                self.remove_participant(conversation, participant, true).await;
            }
            Command::MoveParticipant {
                participant,
                source,
                dest,
            } => {
                // atomic: membership never becomes empty in between, so
                // no cascade fires
                let moved = match self.conversations.get_mut(&source) {
                    Some(conv) => conv.remove_member(participant),
                    None => false,
                };
                if moved {
                    if let Some(part) = self.participants.get_mut(&participant) {
                        part.conversations.remove(&source);
                    }
                    self.add_participant(dest, participant).await;
                    self.apply_auto_hold(source).await;
                }
            }
            Command::ModifyContribution {
                conversation,
                participant,
                input_gain,
                output_gain,
            } => {
                if let Some(conv) = self.conversations.get_mut(&conversation) {
                    if conv.set_contribution(participant, input_gain, output_gain) {
                        self.mixer.set_gains(participant, input_gain, output_gain);
                    }
                }
            }
            Command::OutputBridgeMatrix { reply } => {
                let rendered = self.mixer.render();
                info!("bridge matrix:\n{}", rendered);
                reply.send(rendered).ok();
            }
            Command::AlertParticipant {
                participant,
                early_media,
            } => {
                self.alert_participant(participant, early_media);
            }
            Command::AnswerParticipant { participant } => {
                self.answer_participant(participant);
            }
            Command::RejectParticipant { participant, code } => {
                self.reject_participant(participant, code).await;
            }
            Command::RedirectParticipant {
                participant,
                destination,
            } => {
                self.redirect_participant(participant, destination).await;
            }
            Command::RedirectToParticipant {
                participant,
                target,
            } => {
                self.redirect_to_participant(participant, target).await;
            }
            Command::HoldParticipant { participant, hold } => {
                self.set_hold(participant, hold).await;
            }
            Command::AddCacheBuffer { name, data, codec } => {
                self.cache.add_buffer(&name, data, codec);
            }
            Command::StartTimer {
                id,
                data1,
                data2,
                duration,
            } => {
                let sender = self.command_sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    sender
                        .send(Command::TimerFired { id, data1, data2 })
                        .ok();
                });
            }
            Command::TimerFired { id, data1, data2 } => {
                self.emit(ConversationEvent::ApplicationTimer { id, data1, data2 });
            }
            Command::QueryConversation { handle, reply } => {
                reply
                    .send(self.conversations.get(&handle).map(|c| c.member_handles()))
                    .ok();
            }
            Command::QueryParticipant { handle, reply } => {
                reply
                    .send(
                        self.participants
                            .get(&handle)
                            .filter(|p| !p.terminating)
                            .map(|p| p.conversations.iter().cloned().collect()),
                    )
                    .ok();
            }
            Command::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn destroy_conversation(&mut self, handle: ConversationHandle) {
        let Some(mut conv) = self.conversations.remove(&handle) else {
            return;
        };
        for member in conv.drain_members() {
            let orphaned = match self.participants.get_mut(&member.handle) {
                Some(part) => {
                    part.conversations.remove(&handle);
                    part.conversations.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.destroy_participant(member.handle, true).await;
            }
        }
        self.emit(ConversationEvent::ConversationDestroyed {
            conversation: handle,
        });
    }

    /// Move everyone from `source` into `dest`, preserving the union of
    /// memberships, then delete `source` without releasing anyone.
    async fn join_conversation(&mut self, source: ConversationHandle, dest: ConversationHandle) {
        if !self.conversations.contains_key(&dest) {
            warn!("join target {} not found", dest);
            return;
        }
        let Some(mut src) = self.conversations.remove(&source) else {
            return;
        };
        let members = src.drain_members();
        for member in members {
            if let Some(part) = self.participants.get_mut(&member.handle) {
                part.conversations.remove(&source);
                part.conversations.insert(dest);
            }
            if let Some(conv) = self.conversations.get_mut(&dest) {
                conv.add_member(member.handle);
                conv.set_contribution(
                    member.handle,
                    member.contribution.input_gain,
                    member.contribution.output_gain,
                );
            }
        }
        self.emit(ConversationEvent::ConversationDestroyed {
            conversation: source,
        });
        self.apply_auto_hold(dest).await;
    }

    async fn create_remote_participant(
        &mut self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        destination: rsip::Uri,
        fork_mode: ForkSelectMode,
        headers: Option<Vec<rsip::Header>>,
    ) -> Result<()> {
        let conv = self
            .conversations
            .get(&conversation)
            .ok_or_else(|| Error::ConversationError(format!("{} not found", conversation)))?;

        let direction = match conv.auto_hold {
            AutoHoldMode::BroadcastOnly => MediaDirection::SendOnly,
            AutoHoldMode::Enabled if conv.member_count() == 0 => MediaDirection::SendOnly,
            _ => MediaDirection::SendRecv,
        };
        let offer = self.local_sdp_with(direction);

        let session = self.dialog_layer.invite(InviteOption {
            caller: self.profile.aor.clone(),
            callee: destination,
            contact: self.profile.contact.clone(),
            offer: Some(offer),
            credential: self.profile.credential.clone(),
            headers,
            supports_100rel: true,
        })?;

        let dialog_id = session.id();
        let remote = RemoteParticipant {
            session,
            dialog_id: dialog_id.clone(),
            fork_mode,
            state: RemoteState::Connecting,
            held: direction.is_hold(),
            fork_of: None,
            incoming: false,
        };
        self.participants.insert(
            participant,
            Participant::new(participant, ParticipantKind::Remote(Box::new(remote))),
        );
        self.by_dialog.insert(dialog_id, participant);
        self.add_participant(conversation, participant).await;
        Ok(())
    }

    fn create_media_participant(
        &mut self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        url: &str,
    ) -> Result<()> {
        let url = MediaUrl::from_str(url)?;
        if let MediaSource::Cache(name) = &url.source {
            if self.cache.get_buffer(name).is_none() {
                return Err(Error::MediaUrlError(format!(
                    "no cached buffer named {}",
                    name
                )));
            }
        }
        if !self.conversations.contains_key(&conversation) {
            return Err(Error::ConversationError(format!(
                "{} not found",
                conversation
            )));
        }

        // playback with a bounded duration destroys itself when done
        if let (true, Some(duration)) = (url.is_playback(), url.duration) {
            let sender = self.command_sender.clone();
            let handle = participant;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                sender.send(Command::DestroyParticipant { participant: handle }).ok();
            });
        }

        self.participants.insert(
            participant,
            Participant::new(
                participant,
                ParticipantKind::MediaResource(MediaResourceParticipant { url }),
            ),
        );
        let interface = self
            .conversations
            .get(&conversation)
            .map(|c| c.media_interface)
            .unwrap_or(MediaInterfaceId(0));
        if let Some(conv) = self.conversations.get_mut(&conversation) {
            conv.add_member(participant);
        }
        if let Some(part) = self.participants.get_mut(&participant) {
            part.conversations.insert(conversation);
        }
        self.mixer.add_port(participant, interface);
        Ok(())
    }

    async fn add_participant(
        &mut self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
    ) {
        let interface = match self.conversations.get_mut(&conversation) {
            Some(conv) => {
                if !conv.add_member(participant) {
                    return;
                }
                conv.media_interface
            }
            None => {
                warn!("{} not found", conversation);
                return;
            }
        };
        if let Some(part) = self.participants.get_mut(&participant) {
            part.conversations.insert(conversation);
        } else {
            warn!("{} not found", participant);
            return;
        }
        if !self.mixer.contains(participant) {
            self.mixer.add_port(participant, interface);
        }
        self.apply_auto_hold(conversation).await;
    }

    async fn remove_participant(
        &mut self,
        conversation: ConversationHandle,
        participant: ParticipantHandle,
        cascade: bool,
    ) {
        let removed = match self.conversations.get_mut(&conversation) {
            Some(conv) => conv.remove_member(participant),
            None => false,
        };
        if !removed {
            return;
        }
        let orphaned = match self.participants.get_mut(&participant) {
            Some(part) => {
                part.conversations.remove(&conversation);
                part.conversations.is_empty()
            }
            None => false,
        };
        if orphaned && cascade {
            self.destroy_participant(participant, true).await;
        }
        self.apply_auto_hold(conversation).await;
    }

    /// Idempotent teardown. Exactly one BYE (or CANCEL for an
    /// unanswered outbound leg) is sent per remote participant.
    async fn destroy_participant(&mut self, participant: ParticipantHandle, release: bool) {
        let Some(part) = self.participants.get_mut(&participant) else {
            return;
        };
        if part.terminating {
            return;
        }
        part.terminating = true;

        let conversations: Vec<ConversationHandle> = part.conversations.drain().collect();
        let mut fork_ex_original = None;
        if release {
            if let Some(remote) = part.remote_mut() {
                remote.state = RemoteState::Terminating;
                let session = remote.session.clone();
                let fork_mode = remote.fork_mode;
                let state = session.state();
                if state.is_early_uac() {
                    session.cancel().await.ok();
                    if fork_mode == ForkSelectMode::AutomaticEx {
                        fork_ex_original = Some(participant);
                    }
                } else if state.is_early_uas() {
                    session.reject(StatusCode::Decline).ok();
                } else if !session.is_terminated() {
                    session.bye().await.ok();
                }
            }
        }
        if self.local_participant == Some(participant) {
            self.local_participant = None;
        }
        self.mixer.remove_port(participant);
        for conversation in conversations {
            if let Some(conv) = self.conversations.get_mut(&conversation) {
                conv.remove_member(participant);
            }
            self.apply_auto_hold(conversation).await;
        }
        // remote participants stay registered (terminating) so a late
        // answer can still be matched and released with BYE
        match self.participants.get(&participant).map(|p| &p.kind) {
            Some(ParticipantKind::MediaResource(_)) => {
                self.emit(ConversationEvent::MediaResourceDone { participant });
                self.participants.remove(&participant);
            }
            Some(ParticipantKind::Local) => {
                self.participants.remove(&participant);
            }
            _ => {}
        }
        self.emit(ConversationEvent::ParticipantDestroyed { participant });

        // AutomaticEx: destroying the unanswered original also tears
        // down every fork sibling and its related conversation
        if let Some(original) = fork_ex_original {
            self.destroy_fork_siblings(original);
        }
    }

    /// Enqueue the teardown of every sibling forked off `original`. Goes
    /// through the command queue so teardown never recurses.
    fn destroy_fork_siblings(&mut self, original: ParticipantHandle) {
        let siblings: Vec<ParticipantHandle> = self
            .participants
            .iter()
            .filter(|(_, p)| {
                p.remote()
                    .map(|r| r.fork_of == Some(original))
                    .unwrap_or(false)
            })
            .map(|(h, _)| *h)
            .collect();
        for sibling in siblings {
            let related: Vec<ConversationHandle> = self
                .participants
                .get(&sibling)
                .map(|p| p.conversations.iter().cloned().collect())
                .unwrap_or_default();
            self.command_sender
                .send(Command::DestroyParticipantQuiet {
                    participant: sibling,
                })
                .ok();
            for conv in related {
                self.command_sender
                    .send(Command::DestroyConversation { handle: conv })
                    .ok();
            }
        }
    }

    fn alert_participant(&mut self, participant: ParticipantHandle, early_media: bool) {
        let Some(remote) = self
            .participants
            .get_mut(&participant)
            .and_then(|p| p.remote_mut())
        else {
            return;
        };
        let early_sdp = if early_media {
            Some(self.profile.session_description.clone())
        } else {
            None
        };
        if let Err(e) = remote.session.alert(early_sdp) {
            info!("alert failed on {}: {}", participant, e);
        } else {
            remote.state = RemoteState::Alerting;
        }
    }

    fn answer_participant(&mut self, participant: ParticipantHandle) {
        let answer = self.answer_sdp_for(participant);
        let Some(remote) = self
            .participants
            .get_mut(&participant)
            .and_then(|p| p.remote_mut())
        else {
            return;
        };
        if let Err(e) = remote.session.accept(Some(answer)) {
            info!("answer failed on {}: {}", participant, e);
        }
    }

    async fn reject_participant(&mut self, participant: ParticipantHandle, code: u16) {
        let Some(remote) = self
            .participants
            .get(&participant)
            .and_then(|p| p.remote())
        else {
            return;
        };
        let session = remote.session.clone();
        let state = session.state();
        if state.is_early_uas() {
            let status = StatusCode::from(code);
            session.reject(status).ok();
        } else if state.is_early_uac() {
            session.cancel().await.ok();
        } else {
            debug!("reject ignored for connected {}", participant);
        }
    }

    async fn redirect_participant(
        &mut self,
        participant: ParticipantHandle,
        destination: rsip::Uri,
    ) {
        let Some(remote) = self
            .participants
            .get(&participant)
            .and_then(|p| p.remote())
        else {
            return;
        };
        let session = remote.session.clone();
        if session.state().is_early_uas() {
            // unanswered inbound: a 302 does the job
            match session.redirect(destination) {
                Ok(()) => self.emit(ConversationEvent::ParticipantRedirectSuccess { participant }),
                Err(_) => self.emit(ConversationEvent::ParticipantRedirectFailure {
                    participant,
                    status_code: 500,
                }),
            }
        } else if session.is_connected() {
            // connected: blind transfer; progress comes back as
            // ReferAccepted / ReferRejected
            session.refer(&destination.to_string()).await.ok();
        } else {
            self.emit(ConversationEvent::ParticipantRedirectFailure {
                participant,
                status_code: 400,
            });
        }
    }

    async fn redirect_to_participant(
        &mut self,
        participant: ParticipantHandle,
        target: ParticipantHandle,
    ) {
        let (session, target_session, target_dialog) = {
            let a = self
                .participants
                .get(&participant)
                .and_then(|p| p.remote());
            let b = self.participants.get(&target).and_then(|p| p.remote());
            match (a, b) {
                (Some(a), Some(b)) => (
                    a.session.clone(),
                    b.session.clone(),
                    b.session.id(),
                ),
                _ => return,
            }
        };
        // attended transfer requires two established dialogs
        if !session.is_connected() || !target_session.is_connected() {
            self.emit(ConversationEvent::ParticipantRedirectFailure {
                participant,
                status_code: 400,
            });
            return;
        }
        let target_uri = target_session
            .inner
            .dialog
            .remote_target
            .lock()
            .unwrap()
            .to_string();
        session
            .refer_with_replaces(&target_uri, &target_dialog)
            .await
            .ok();
    }

    async fn set_hold(&mut self, participant: ParticipantHandle, hold: bool) {
        let direction = if hold {
            MediaDirection::SendRecv.hold()
        } else {
            MediaDirection::SendRecv
        };
        let sdp = self.local_sdp_with(direction);
        let Some(remote) = self
            .participants
            .get_mut(&participant)
            .and_then(|p| p.remote_mut())
        else {
            return;
        };
        if remote.held == hold || !remote.session.is_connected() {
            remote.held = hold;
            return;
        }
        remote.held = hold;
        let session = remote.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.reinvite(sdp).await {
                info!("hold re-INVITE failed: {}", e);
            }
        });
    }

    /// Re-evaluate hold state for every remote member after a
    /// membership change.
    async fn apply_auto_hold(&mut self, conversation: ConversationHandle) {
        let (mode, members) = match self.conversations.get(&conversation) {
            Some(conv) => (conv.auto_hold, conv.member_handles()),
            None => return,
        };
        if mode == AutoHoldMode::Disabled {
            return;
        }
        for member in members {
            let should_hold = match mode {
                AutoHoldMode::BroadcastOnly => true,
                AutoHoldMode::Enabled => self
                    .conversations
                    .get(&conversation)
                    .map(|c| c.is_sole_member(member))
                    .unwrap_or(false),
                AutoHoldMode::Disabled => false,
            };
            let needs_change = self
                .participants
                .get(&member)
                .and_then(|p| p.remote())
                .map(|r| r.held != should_hold && r.session.is_connected())
                .unwrap_or(false);
            if needs_change {
                self.set_hold(member, should_hold).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // session events
    // ------------------------------------------------------------------

    async fn on_session_event(&mut self, id: DialogId, event: SessionEvent) {
        match event {
            SessionEvent::NewSession { incoming, from, .. } => {
                if incoming {
                    self.on_incoming_session(id, from);
                }
            }
            SessionEvent::Forked { original } => {
                self.on_forked(id, original).await;
            }
            SessionEvent::Provisional { code } => {
                if let Some(participant) = self.participant_for(&id) {
                    if code < 180 {
                        self.emit(ConversationEvent::ParticipantProceeding { participant, code });
                    } else {
                        if let Some(remote) = self
                            .participants
                            .get_mut(&participant)
                            .and_then(|p| p.remote_mut())
                        {
                            remote.state = RemoteState::Alerting;
                        }
                        self.emit(ConversationEvent::ParticipantAlerting {
                            participant,
                            early_media: code == 183,
                        });
                    }
                }
            }
            SessionEvent::EarlyMedia { .. } => {}
            SessionEvent::Connected { .. } => {
                self.on_connected(id).await;
            }
            SessionEvent::ConnectedConfirmed => {
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::ParticipantConnectedConfirmed { participant });
                }
            }
            SessionEvent::Offer { exchange: _, sdp } => {
                self.on_offer(id, sdp);
            }
            SessionEvent::OfferRequired => {
                self.on_offer_required(id);
            }
            SessionEvent::OfferRejected { code } => {
                debug!("offer rejected with {} on {}", code, id);
            }
            SessionEvent::Answer { .. } => {}
            SessionEvent::RequestedHold { held } => {
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::ParticipantRequestedHold { participant, held });
                }
            }
            SessionEvent::Dtmf {
                digit,
                duration_ms,
                up,
            } => {
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::DtmfEvent {
                        participant,
                        digit,
                        duration_ms,
                        up,
                    });
                }
            }
            SessionEvent::ReferAccepted => {
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::ParticipantRedirectSuccess { participant });
                }
            }
            SessionEvent::ReferRejected { code } => {
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::ParticipantRedirectFailure {
                        participant,
                        status_code: code,
                    });
                }
            }
            SessionEvent::Refer { target } => {
                // a transfer request from the peer becomes an outgoing
                // call request for the application
                if let Some(participant) = self.participant_for(&id) {
                    self.emit(ConversationEvent::RequestOutgoingParticipant {
                        referred_by: participant,
                        target,
                    });
                }
            }
            SessionEvent::Terminated { reason } => {
                self.on_terminated(id, reason).await;
            }
            SessionEvent::StaleCallTimeout => {
                debug!("stale call timeout on {}", id);
            }
            _ => {}
        }
    }

    fn on_incoming_session(&mut self, id: DialogId, from: String) {
        let Some(session) = self.dialog_layer.get_session(&id) else {
            return;
        };
        let participant = self.allocator.participant();
        let remote = RemoteParticipant {
            session,
            dialog_id: id.clone(),
            fork_mode: ForkSelectMode::Automatic,
            state: RemoteState::Connecting,
            held: false,
            fork_of: None,
            incoming: true,
        };
        self.participants.insert(
            participant,
            Participant::new(participant, ParticipantKind::Remote(Box::new(remote))),
        );
        self.by_dialog.insert(id, participant);
        self.emit(ConversationEvent::IncomingParticipant { participant, from });
    }

    /// A fork sibling appeared: mirror it as a related conversation and
    /// participant sharing the original's media interface.
    async fn on_forked(&mut self, id: DialogId, original: DialogId) {
        let Some(original_part) = self.participant_for(&original) else {
            return;
        };
        let Some(session) = self.dialog_layer.get_session(&id) else {
            return;
        };
        let (fork_mode, original_conv) = match self.participants.get(&original_part) {
            Some(p) => (
                p.remote().map(|r| r.fork_mode).unwrap_or_default(),
                p.conversations.iter().next().cloned(),
            ),
            None => return,
        };
        let Some(original_conv) = original_conv else {
            return;
        };

        let related_conv = self.allocator.conversation();
        let (mode, interface) = self
            .conversations
            .get(&original_conv)
            .map(|c| (c.auto_hold, c.media_interface))
            .unwrap_or((AutoHoldMode::Enabled, MediaInterfaceId(0)));
        let mut conv = Conversation::new(related_conv, mode, interface);
        conv.related_to = Some(original_conv);
        self.conversations.insert(related_conv, conv);

        let participant = self.allocator.participant();
        let remote = RemoteParticipant {
            session,
            dialog_id: id.clone(),
            fork_mode,
            state: RemoteState::Connecting,
            held: false,
            fork_of: Some(original_part),
            incoming: false,
        };
        self.participants.insert(
            participant,
            Participant::new(participant, ParticipantKind::Remote(Box::new(remote))),
        );
        self.by_dialog.insert(id, participant);
        self.add_participant(related_conv, participant).await;

        self.emit(ConversationEvent::RelatedConversation {
            related_conversation: related_conv,
            related_participant: participant,
            original_conversation: original_conv,
            original_participant: original_part,
        });
    }

    async fn on_connected(&mut self, id: DialogId) {
        let Some(participant) = self.participant_for(&id) else {
            // a fork that lost before we ever tracked it: confirm-then-
            // release
            if let Some(session) = self.dialog_layer.get_session(&id) {
                info!("late 2xx on untracked {}; releasing", id);
                session.bye().await.ok();
            }
            return;
        };
        let terminating = self
            .participants
            .get(&participant)
            .map(|p| p.terminating)
            .unwrap_or(true);
        if terminating {
            // answer raced with our teardown: the call is confirmed and
            // must be released with BYE (never CANCEL)
            if let Some(session) = self.dialog_layer.get_session(&id) {
                session.bye().await.ok();
            }
            return;
        }

        if let Some(remote) = self
            .participants
            .get_mut(&participant)
            .and_then(|p| p.remote_mut())
        {
            remote.state = RemoteState::Connected;
        }
        self.emit(ConversationEvent::ParticipantConnected { participant });
        self.apply_fork_policy(participant).await;

        let convs: Vec<ConversationHandle> = self
            .participants
            .get(&participant)
            .map(|p| p.conversations.iter().cloned().collect())
            .unwrap_or_default();
        for conv in convs {
            self.apply_auto_hold(conv).await;
        }
    }

    /// First answer wins under the automatic modes: every other fork is
    /// released (BYE if it answered, silently dropped while early) and
    /// its related conversation destroyed.
    async fn apply_fork_policy(&mut self, winner: ParticipantHandle) {
        let (fork_mode, group_original) = match self
            .participants
            .get(&winner)
            .and_then(|p| p.remote())
        {
            Some(remote) => (remote.fork_mode, remote.fork_of.unwrap_or(winner)),
            None => return,
        };
        if fork_mode == ForkSelectMode::Manual {
            return;
        }

        let losers: Vec<ParticipantHandle> = self
            .participants
            .iter()
            .filter(|(h, p)| {
                **h != winner
                    && p.remote()
                        .map(|r| {
                            let member =
                                r.fork_of == Some(group_original) || **h == group_original;
                            member && !r.incoming
                        })
                        .unwrap_or(false)
            })
            .map(|(h, _)| *h)
            .collect();

        // the winner may itself be a sibling; adopt the original's
        // conversation so the call lands where the application put it
        if winner != group_original {
            let original_convs: Vec<ConversationHandle> = self
                .participants
                .get(&group_original)
                .map(|p| p.conversations.iter().cloned().collect())
                .unwrap_or_default();
            let winner_convs: Vec<ConversationHandle> = self
                .participants
                .get(&winner)
                .map(|p| p.conversations.iter().cloned().collect())
                .unwrap_or_default();
            for conv in original_convs {
                self.add_participant(conv, winner).await;
            }
            for conv in winner_convs {
                self.remove_participant(conv, winner, false).await;
                self.destroy_conversation(conv).await;
            }
        }

        for loser in losers {
            self.emit_fork_destroyed(loser);
            let (related, confirmed) = {
                let part = self.participants.get(&loser);
                let related: Vec<ConversationHandle> = part
                    .map(|p| {
                        p.conversations
                            .iter()
                            .filter(|c| {
                                self.conversations
                                    .get(c)
                                    .map(|conv| conv.related_to.is_some())
                                    .unwrap_or(false)
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                let confirmed = part
                    .and_then(|p| p.remote())
                    .map(|r| r.state == RemoteState::Connected)
                    .unwrap_or(false);
                (related, confirmed)
            };
            // confirmed losers are released with BYE; early ones are
            // dropped without CANCEL, their session left registered so a
            // late 2xx is confirmed and then released
            self.destroy_participant(loser, confirmed).await;
            for conv in related {
                self.destroy_conversation(conv).await;
            }
        }
    }

    fn emit_fork_destroyed(&self, participant: ParticipantHandle) {
        if let Some(remote) = self.participants.get(&participant).and_then(|p| p.remote()) {
            remote.session.notify_fork_destroyed();
        }
    }

    /// Remote offer on an established leg (re-INVITE or UPDATE): answer
    /// from the engine's template, mirroring the offered direction, with
    /// the broadcast override where configured.
    fn on_offer(&mut self, id: DialogId, sdp: Vec<u8>) {
        let Some(participant) = self.participant_for(&id) else {
            return;
        };
        let Some(session) = self.dialog_layer.get_session(&id) else {
            return;
        };
        let state = session.state();
        // the initial INVITE offer waits for answer_participant
        if state == SessionState::UasStart || state == SessionState::UasOffer {
            return;
        }
        let answer = self.answer_sdp_for_offer(participant, &sdp);
        let result = match state {
            SessionState::ReceivedReinvite => session.accept_reinvite(answer),
            SessionState::ReceivedUpdate => session.accept_update(answer),
            _ => session.provide_answer(answer),
        };
        if let Err(e) = result {
            info!("failed to answer offer on {}: {}", id, e);
        }
    }

    fn on_offer_required(&mut self, id: DialogId) {
        let Some(session) = self.dialog_layer.get_session(&id) else {
            return;
        };
        let state = session.state();
        if state == SessionState::ReceivedReinvite {
            let offer = self.profile.session_description.clone();
            session.accept_reinvite(offer).ok();
        }
    }

    async fn on_terminated(&mut self, id: DialogId, reason: TerminatedReason) {
        let Some(participant) = self.participant_for(&id) else {
            return;
        };
        self.by_dialog.remove(&id);
        let already_terminating = self
            .participants
            .get(&participant)
            .map(|p| p.terminating)
            .unwrap_or(true);

        self.emit(ConversationEvent::ParticipantTerminated {
            participant,
            status_code: termination_status(reason),
        });
        if !already_terminating {
            // remote ended it; our side must not send another BYE
            self.destroy_participant(participant, false).await;
        }
        self.participants.remove(&participant);
    }

    // ------------------------------------------------------------------
    // sdp plumbing
    // ------------------------------------------------------------------

    fn local_sdp_with(&self, direction: MediaDirection) -> Vec<u8> {
        let text = String::from_utf8_lossy(&self.profile.session_description);
        sdp::with_direction(&text, direction).into_bytes()
    }

    fn answer_sdp_for(&self, participant: ParticipantHandle) -> Vec<u8> {
        let offer = self
            .participants
            .get(&participant)
            .and_then(|p| p.remote())
            .and_then(|r| r.session.remote_sdp())
            .or_else(|| {
                self.participants
                    .get(&participant)
                    .and_then(|p| p.remote())
                    .map(|r| r.session.inner.dialog.initial_request.body.clone())
            })
            .unwrap_or_default();
        self.answer_sdp_for_offer(participant, &offer)
    }

    fn answer_sdp_for_offer(&self, participant: ParticipantHandle, offer: &[u8]) -> Vec<u8> {
        let offered = std::str::from_utf8(offer)
            .map(sdp::direction_of)
            .unwrap_or_default();
        let broadcast = self
            .participants
            .get(&participant)
            .map(|p| {
                p.conversations.iter().any(|c| {
                    self.conversations
                        .get(c)
                        .map(|conv| conv.auto_hold == AutoHoldMode::BroadcastOnly)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        let direction = if broadcast {
            // inactive and recvonly offers are both answered sendonly:
            // the broadcast conversation never takes inbound media
            MediaDirection::SendOnly
        } else {
            offered.answer()
        };
        self.local_sdp_with(direction)
    }

    /// Fatal shutdown: every participant is reported terminated with a
    /// 500 and remote legs are released.
    async fn on_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("conversation manager shutting down");
        let handles: Vec<ParticipantHandle> = self.participants.keys().cloned().collect();
        for participant in handles {
            self.emit(ConversationEvent::ParticipantTerminated {
                participant,
                status_code: 500,
            });
            self.destroy_participant(participant, true).await;
        }
        let conversations: Vec<ConversationHandle> =
            self.conversations.keys().cloned().collect();
        for conversation in conversations {
            self.destroy_conversation(conversation).await;
        }
    }
}

fn termination_status(reason: TerminatedReason) -> u16 {
    match reason {
        TerminatedReason::Ended | TerminatedReason::PeerEnded => 200,
        TerminatedReason::Cancelled => 487,
        TerminatedReason::Rejected => 603,
        TerminatedReason::NetworkError => 408,
        TerminatedReason::RemoteError => 500,
        TerminatedReason::LocalError => 500,
        TerminatedReason::StaleReInvite => 408,
        TerminatedReason::Referred => 302,
    }
}
