use super::{
    dialog::DialogInner,
    dialog_set::{DialogSet, DialogSetRef},
    session::{InviteSession, SessionEvent, SessionEventSender, SessionState},
    subscription::Subscription,
    DialogId, DialogSetId,
};
use crate::{
    transaction::{
        endpoint::EndpointInnerRef, make_tag, transaction::Transaction, EndpointEvent,
        EndpointEventReceiver,
    },
    Result,
};
use rsip::{Method, StatusCode};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};
use tracing::{debug, info, warn};

pub struct DialogLayerInner {
    pub(crate) endpoint: EndpointInnerRef,
    sessions: RwLock<HashMap<DialogId, InviteSession>>,
    dialog_sets: RwLock<HashMap<DialogSetId, DialogSetRef>>,
    subscriptions: RwLock<HashMap<DialogId, Vec<Subscription>>>,
    event_sender: Mutex<Option<SessionEventSender>>,
}

pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

/// Owns every dialog and its INVITE usage. Inbound traffic from the
/// endpoint is matched here: requests to their dialog (or a new UAS
/// session), 2xx ACKs to their dialog directly, and stray responses to
/// the dialog set they fork from.
pub struct DialogLayer {
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        DialogLayer {
            inner: Arc::new(DialogLayerInner {
                endpoint,
                sessions: RwLock::new(HashMap::new()),
                dialog_sets: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                event_sender: Mutex::new(None),
            }),
        }
    }

    pub fn set_event_sender(&self, sender: SessionEventSender) {
        self.inner.event_sender.lock().unwrap().replace(sender);
    }

    pub fn get_session(&self, id: &DialogId) -> Option<InviteSession> {
        self.inner.get_session(id)
    }

    pub fn dialog_set(&self, id: &DialogSetId) -> Option<DialogSetRef> {
        self.inner.dialog_sets.read().unwrap().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    /// Consume endpoint events until the channel closes. In-dialog
    /// requests are handled inline so per-dialog wire order is
    /// preserved; only long-running INVITE loops are spawned.
    pub async fn serve(&self, mut events: EndpointEventReceiver) -> Result<()> {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::Request(tx) => {
                    if let Err(e) = self.dispatch_request(tx).await {
                        info!("failed to dispatch request: {}", e);
                    }
                }
                EndpointEvent::Ack(req, _connection) => {
                    match DialogId::try_from(&req) {
                        Ok(id) => match self.inner.get_session(&id) {
                            Some(session) => session.handle_ack(req).await,
                            None => debug!("ACK for unknown dialog {}", id),
                        },
                        Err(e) => debug!("unparsable ACK: {}", e),
                    }
                }
                EndpointEvent::StrayResponse(resp) => {
                    self.dispatch_stray_response(resp).await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_request(&self, mut tx: Transaction) -> Result<()> {
        let id = match DialogId::try_from(&tx.original) {
            Ok(id) => id,
            Err(e) => {
                info!("request without dialog identity: {}", e);
                tx.reply(StatusCode::BadRequest).await?;
                return Ok(());
            }
        };

        if !id.to_tag.is_empty() {
            // in-dialog request: a subscription usage claims SUBSCRIBE
            // and NOTIFY on its dialog, everything else goes to the
            // INVITE usage
            if matches!(tx.original.method, Method::Subscribe | Method::Notify) {
                if let Some(subscription) = self.inner.get_subscription(&id) {
                    return subscription.handle_request(tx).await;
                }
            }
            match self.inner.get_session(&id) {
                Some(session) => return session.handle_request(tx).await,
                None => {
                    // also the landing spot for the loser of a
                    // simultaneous-BYE race
                    debug!("no dialog for in-dialog request {}", id);
                    tx.reply(StatusCode::CallTransactionDoesNotExist).await?;
                    return Ok(());
                }
            }
        }

        match tx.original.method {
            Method::Invite => self.accept_uas_invite(id, tx),
            Method::Subscribe => self.accept_uas_subscribe(id, tx).await,
            Method::Options => {
                tx.reply(StatusCode::OK).await?;
                Ok(())
            }
            Method::Ack => Ok(()),
            _ => {
                debug!("out-of-dialog {} rejected", tx.original.method);
                tx.reply(StatusCode::MethodNotAllowed).await?;
                Ok(())
            }
        }
    }

    /// A new inbound INVITE: mint the local tag, build the dialog and
    /// session, and spawn the server transaction loop.
    fn accept_uas_invite(&self, mut id: DialogId, tx: Transaction) -> Result<()> {
        id.to_tag = make_tag().to_string();

        let contact = self.local_contact();
        let dialog = DialogInner::new_server(
            id.clone(),
            tx.original.clone(),
            self.inner.endpoint.clone(),
            contact,
        )?;
        let events = self.inner.event_sender()?;
        let session = InviteSession::new(
            Arc::new(dialog),
            events,
            Arc::downgrade(&self.inner),
            SessionState::UasStart,
        );
        self.inner.register_session(session.clone());
        info!("new UAS session {}", id);

        tokio::spawn(async move {
            if let Err(e) = session.process_uas_invite(tx).await {
                warn!("UAS INVITE processing failed: {}", e);
            }
        });
        Ok(())
    }

    async fn dispatch_stray_response(&self, resp: rsip::Response) {
        let id = match DialogId::try_from(&resp) {
            Ok(id) => id,
            Err(_) => return,
        };
        if let Some(session) = self.inner.get_session(&id) {
            session.handle_stray_response(resp).await;
            return;
        }
        // a fork we have not met yet: find its set by call-id and local
        // tag and grow a sibling from the original session
        let set_id = DialogSetId::new(&id.call_id, &id.from_tag);
        let set = self.inner.dialog_sets.read().unwrap().get(&set_id).cloned();
        let Some(set) = set else {
            debug!("stray response for unknown dialog set {}", set_id);
            return;
        };
        let original = set
            .dialog_ids()
            .into_iter()
            .find_map(|d| self.inner.get_session(&d));
        let Some(original) = original else {
            debug!("stray response but every fork is gone: {}", set_id);
            return;
        };
        let sibling = self.inner.fork_session(&original, &id.to_tag);
        sibling.handle_stray_response(resp).await;
    }

    pub(crate) fn local_contact(&self) -> Option<rsip::Uri> {
        self.inner
            .endpoint
            .selector
            .get_addrs()
            .into_iter()
            .next()
            .map(|addr| rsip::Uri::from(&addr))
    }

    /// Shut down every session, sending BYE where a dialog is
    /// established.
    pub async fn shutdown(&self) {
        let sessions: Vec<InviteSession> = self
            .inner
            .sessions
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for session in sessions {
            if session.is_connected() {
                session.bye().await.ok();
            }
        }
    }
}

impl DialogLayerInner {
    pub(crate) fn event_sender(&self) -> Result<SessionEventSender> {
        self.event_sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| crate::Error::EndpointError("no session event sender set".into()))
    }

    pub(crate) fn get_session(&self, id: &DialogId) -> Option<InviteSession> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub(crate) fn attach_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .unwrap()
            .entry(subscription.id())
            .or_default()
            .push(subscription);
    }

    pub(crate) fn get_subscription(&self, id: &DialogId) -> Option<Subscription> {
        self.subscriptions
            .read()
            .unwrap()
            .get(id)
            .and_then(|subs| subs.first().cloned())
    }

    pub(crate) fn register_session(&self, session: InviteSession) {
        let id = session.id();
        self.sessions.write().unwrap().insert(id.clone(), session);
        let set_id = DialogSetId::new(&id.call_id, &id.from_tag);
        let set = self
            .dialog_sets
            .write()
            .unwrap()
            .entry(set_id.clone())
            .or_insert_with(|| Arc::new(DialogSet::new(set_id)))
            .clone();
        set.insert(&id.to_tag.clone(), id);
    }

    /// A response taught us the remote tag: move the session under its
    /// confirmed identity.
    pub(crate) fn rekey_session(&self, old_id: &DialogId, session: InviteSession) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.remove(old_id);
        let id = session.id();
        sessions.insert(id.clone(), session);
        drop(sessions);
        let set_id = DialogSetId::new(&id.call_id, &id.from_tag);
        if let Some(set) = self.dialog_sets.read().unwrap().get(&set_id) {
            set.remove(&old_id.to_tag);
            set.insert(&id.to_tag.clone(), id);
        }
    }

    pub(crate) fn remove_session(&self, id: &DialogId) {
        debug!("removing session {}", id);
        self.sessions.write().unwrap().remove(id);
        let set_id = DialogSetId::new(&id.call_id, &id.from_tag);
        let empty = {
            let sets = self.dialog_sets.read().unwrap();
            match sets.get(&set_id) {
                Some(set) => {
                    set.remove(&id.to_tag);
                    set.is_empty()
                }
                None => false,
            }
        };
        if empty {
            self.dialog_sets.write().unwrap().remove(&set_id);
        }
    }

    /// Materialize a sibling session for a newly seen fork of
    /// `original`'s INVITE.
    pub(crate) fn fork_session(
        self: &Arc<Self>,
        original: &InviteSession,
        remote_tag: &str,
    ) -> InviteSession {
        let original_id = original.id();
        let mut id = original_id.clone();
        id.to_tag = remote_tag.to_string();
        if let Some(existing) = self.get_session(&id) {
            return existing;
        }

        let initial = original.inner.dialog.initial_request.clone();
        let dialog = match DialogInner::new_client(
            id.clone(),
            initial,
            self.endpoint.clone(),
            original.inner.dialog.credential.clone(),
            original.inner.dialog.local_contact.clone(),
        ) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!("failed to build fork dialog: {}", e);
                return original.clone();
            }
        };
        dialog.update_remote_tag(remote_tag);

        let events = match self.event_sender() {
            Ok(events) => events,
            Err(_) => return original.clone(),
        };
        let session = InviteSession::new(
            Arc::new(dialog),
            events.clone(),
            Arc::downgrade(self),
            SessionState::UacEarly,
        );
        session.inherit_invite_offer();
        self.register_session(session.clone());
        info!("fork session {} (from {})", session.id(), original_id);
        events
            .send((
                session.id(),
                SessionEvent::Forked {
                    original: original_id,
                },
            ))
            .ok();
        session
    }
}
