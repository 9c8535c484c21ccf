use super::{dialog::DialogInnerRef, dialog_layer::DialogLayerInner, DialogId};
use crate::{
    rsip_ext::{header_contains_token, parse_rseq_header},
    sdp,
    transaction::{
        message::make_cancel, transaction::Transaction, TransactionEvent, TransactionEventSender,
    },
    Error, Result,
};
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::{debug, info, warn};

/// INVITE usage states. UAC and UAS converge on `Connected`; re-INVITE
/// and UPDATE pass through the four intermediate states and return to
/// `Connected` when their exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    UacStart,
    UacEarly,
    UacEarlyWithOffer,
    UacEarlyWithAnswer,
    UacConnected,
    UasStart,
    UasOffer,
    UasEarlyOffer,
    UasAccepted,
    Connected,
    SentUpdate,
    ReceivedUpdate,
    SentReinvite,
    ReceivedReinvite,
    Terminated,
}

impl SessionState {
    pub fn is_early_uac(&self) -> bool {
        matches!(
            self,
            SessionState::UacStart
                | SessionState::UacEarly
                | SessionState::UacEarlyWithOffer
                | SessionState::UacEarlyWithAnswer
        )
    }

    pub fn is_early_uas(&self) -> bool {
        matches!(
            self,
            SessionState::UasStart | SessionState::UasOffer | SessionState::UasEarlyOffer
        )
    }

    pub fn can_bye(&self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::UacConnected
                | SessionState::SentUpdate
                | SessionState::ReceivedUpdate
                | SessionState::SentReinvite
                | SessionState::ReceivedReinvite
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatedReason {
    Ended,
    PeerEnded,
    Cancelled,
    Rejected,
    LocalError,
    RemoteError,
    NetworkError,
    StaleReInvite,
    Referred,
}

/// Which message of the handshake carried each half of an SDP exchange
/// (RFC 3264 over the RFC 3261 message flows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAnswerExchange {
    OfferInInvite,
    AnswerInOk,
    OfferInOk,
    AnswerInAck,
    OfferInUpdate,
    AnswerInUpdateOk,
    OfferInReinvite,
    AnswerInReinviteOk,
}

impl OfferAnswerExchange {
    fn answer_kind(&self) -> OfferAnswerExchange {
        match self {
            OfferAnswerExchange::OfferInInvite => OfferAnswerExchange::AnswerInOk,
            OfferAnswerExchange::OfferInOk => OfferAnswerExchange::AnswerInAck,
            OfferAnswerExchange::OfferInUpdate => OfferAnswerExchange::AnswerInUpdateOk,
            OfferAnswerExchange::OfferInReinvite => OfferAnswerExchange::AnswerInReinviteOk,
            other => *other,
        }
    }
}

struct PendingOffer {
    exchange: OfferAnswerExchange,
    local: bool,
    sdp: Vec<u8>,
}

/// RFC 3264 bookkeeping: at most one offer may be outstanding at any
/// instant. Violations surface as `Error::NegotiationError` and abort
/// the session with `LocalError`.
#[derive(Default)]
struct OfferAnswerState {
    local_sdp: Option<Vec<u8>>,
    remote_sdp: Option<Vec<u8>>,
    pending: Option<PendingOffer>,
}

impl OfferAnswerState {
    fn offer_made(
        &mut self,
        exchange: OfferAnswerExchange,
        local: bool,
        sdp: Vec<u8>,
    ) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::NegotiationError(
                "an offer is already outstanding".to_string(),
            ));
        }
        self.pending = Some(PendingOffer {
            exchange,
            local,
            sdp,
        });
        Ok(())
    }

    fn apply_answer(&mut self, answer: Vec<u8>) -> Result<(OfferAnswerExchange, bool)> {
        let pending = self.pending.take().ok_or_else(|| {
            Error::NegotiationError("answer received with no outstanding offer".to_string())
        })?;
        if pending.local {
            self.local_sdp = Some(pending.sdp);
            self.remote_sdp = Some(answer);
        } else {
            self.remote_sdp = Some(pending.sdp);
            self.local_sdp = Some(answer);
        }
        Ok((pending.exchange.answer_kind(), pending.local))
    }

    fn rollback(&mut self) {
        self.pending = None;
    }

    fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn pending_is_local(&self) -> Option<bool> {
        self.pending.as_ref().map(|p| p.local)
    }
}

/// Everything the session reports to its subscriber, tagged with the
/// dialog it happened on. One enum instead of a fan of handler traits so
/// delivery order is a property of the channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NewSession {
        incoming: bool,
        from: String,
        offer: Option<Vec<u8>>,
    },
    Provisional {
        code: u16,
    },
    EarlyMedia {
        sdp: Vec<u8>,
    },
    Connected {
        sdp: Option<Vec<u8>>,
    },
    ConnectedConfirmed,
    Offer {
        exchange: OfferAnswerExchange,
        sdp: Vec<u8>,
    },
    OfferRequired,
    OfferRejected {
        code: u16,
    },
    Answer {
        exchange: OfferAnswerExchange,
        sdp: Vec<u8>,
    },
    Refer {
        target: String,
    },
    ReferAccepted,
    ReferRejected {
        code: u16,
    },
    Info {
        body: Vec<u8>,
    },
    InfoSuccess,
    InfoFailure {
        code: u16,
    },
    MessageReceived {
        body: Vec<u8>,
    },
    MessageSuccess,
    MessageFailure {
        code: u16,
    },
    Dtmf {
        digit: char,
        duration_ms: u32,
        up: bool,
    },
    RequestedHold {
        held: bool,
    },
    Redirected {
        contacts: Vec<String>,
    },
    Forked {
        original: DialogId,
    },
    ForkDestroyed,
    StaleCallTimeout,
    NewSubscription {
        event_package: String,
        incoming: bool,
    },
    NotifyReceived {
        event_package: String,
        body: Vec<u8>,
        terminated: bool,
    },
    SubscriptionTerminated,
    Terminated {
        reason: TerminatedReason,
    },
}

pub type SessionEventSender = UnboundedSender<(DialogId, SessionEvent)>;

pub(crate) struct SessionInner {
    pub dialog: DialogInnerRef,
    state: Mutex<SessionState>,
    oa: Mutex<OfferAnswerState>,
    events: SessionEventSender,
    layer: Weak<DialogLayerInner>,
    /// sender into the live server INVITE transaction, for accept/reject
    server_tx_sender: Mutex<Option<TransactionEventSender>>,
    /// sender into a live server UPDATE transaction awaiting its answer
    update_tx_sender: Mutex<Option<(TransactionEventSender, Request)>>,
    /// completes the offer-in-2xx flow with the answer carried in ACK
    answer_waiter: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    cancel_requested: Mutex<bool>,
    /// a remote participant that becomes memberless emits exactly one BYE
    bye_sent: Mutex<bool>,
    /// CSeq of the INVITE/re-INVITE whose 2xx we are ACKing
    invite_cseq: Mutex<u32>,
    supports_100rel: bool,
    last_rseq: Mutex<u32>,
    /// state to resume after an UPDATE exchange settles
    resume_state: Mutex<SessionState>,
}

/// One INVITE usage bound to one dialog. Cheap to clone; all state is
/// behind the shared inner.
#[derive(Clone)]
pub struct InviteSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl InviteSession {
    pub(crate) fn new(
        dialog: DialogInnerRef,
        events: SessionEventSender,
        layer: Weak<DialogLayerInner>,
        initial_state: SessionState,
    ) -> Self {
        let supports_100rel = header_contains_token(
            dialog.initial_request.headers(),
            "Supported",
            "100rel",
        ) || header_contains_token(dialog.initial_request.headers(), "Require", "100rel");
        let invite_cseq = dialog
            .initial_request
            .cseq_header()
            .ok()
            .and_then(|c| c.seq().ok())
            .unwrap_or(1);
        InviteSession {
            inner: Arc::new(SessionInner {
                dialog,
                state: Mutex::new(initial_state),
                oa: Mutex::new(OfferAnswerState::default()),
                events,
                layer,
                server_tx_sender: Mutex::new(None),
                update_tx_sender: Mutex::new(None),
                answer_waiter: Mutex::new(None),
                cancel_requested: Mutex::new(false),
                bye_sent: Mutex::new(false),
                invite_cseq: Mutex::new(invite_cseq),
                supports_100rel,
                last_rseq: Mutex::new(0),
                resume_state: Mutex::new(SessionState::Connected),
            }),
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.dialog.id()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub fn is_connected(&self) -> bool {
        self.state().can_bye()
    }

    pub fn local_sdp(&self) -> Option<Vec<u8>> {
        self.inner.oa.lock().unwrap().local_sdp.clone()
    }

    pub fn remote_sdp(&self) -> Option<Vec<u8>> {
        self.inner.oa.lock().unwrap().remote_sdp.clone()
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.events.send((self.id(), event)).ok();
    }

    /// Tell the subscriber this session lost its fork race.
    pub fn notify_fork_destroyed(&self) {
        self.emit(SessionEvent::ForkDestroyed);
    }

    /// A fork sibling negotiates against the same offer the INVITE
    /// carried.
    pub(crate) fn inherit_invite_offer(&self) {
        let body = self.inner.dialog.initial_request.body.clone();
        if !body.is_empty() {
            self.inner
                .oa
                .lock()
                .unwrap()
                .offer_made(OfferAnswerExchange::OfferInInvite, true, body)
                .ok();
        }
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == SessionState::Terminated {
            return;
        }
        debug!("{} session {} -> {}", self.id(), state, next);
        *state = next;
    }

    /// Idempotent terminal transition: exactly one Terminated event per
    /// session.
    fn terminate(&self, reason: TerminatedReason) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }
        info!("session {} terminated: {:?}", self.id(), reason);
        self.inner.dialog.cancel_token.cancel();
        if let Some(layer) = self.inner.layer.upgrade() {
            layer.remove_session(&self.id());
        }
        self.emit(SessionEvent::Terminated { reason });
    }

    // ------------------------------------------------------------------
    // UAC
    // ------------------------------------------------------------------

    /// Drive the initial INVITE transaction to its conclusion. Forked
    /// provisionals split off sibling sessions through the dialog layer.
    pub(crate) async fn process_uac_invite(
        &self,
        mut tx: Transaction,
        offer: Option<Vec<u8>>,
    ) -> Result<()> {
        if let Some(offer) = offer {
            self.inner.oa.lock().unwrap().offer_made(
                OfferAnswerExchange::OfferInInvite,
                true,
                offer,
            )?;
        }
        tx.send().await?;

        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };
            let status = resp.status_code.code();
            match resp.status_code.kind() {
                StatusCodeKind::Provisional => {
                    if status == 100 {
                        continue;
                    }
                    let session = self.fork_target(&resp);
                    session.on_uac_provisional(&resp).await;
                }
                StatusCodeKind::Successful => {
                    let session = self.fork_target(&resp);
                    session.on_uac_success(resp, Some(&mut tx)).await?;
                }
                StatusCodeKind::Redirection => {
                    let contacts = resp
                        .headers()
                        .iter()
                        .filter_map(|h| match h {
                            Header::Contact(c) => Some(c.value().to_string()),
                            _ => None,
                        })
                        .collect();
                    self.emit(SessionEvent::Redirected { contacts });
                    self.terminate(TerminatedReason::Rejected);
                }
                _ => {
                    self.on_uac_failure(status);
                }
            }
        }
        Ok(())
    }

    /// Pick the session a response belongs to by its To tag, creating a
    /// sibling for a fresh fork.
    fn fork_target(&self, resp: &Response) -> InviteSession {
        let tag = resp
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok().flatten())
            .map(|t| t.value().to_string())
            .unwrap_or_default();
        if tag.is_empty() {
            return self.clone();
        }
        let our_tag = self.id().to_tag;
        if our_tag.is_empty() || our_tag == tag {
            return self.clone();
        }
        match self.inner.layer.upgrade() {
            Some(layer) => layer.fork_session(self, &tag),
            None => self.clone(),
        }
    }

    async fn on_uac_provisional(&self, resp: &Response) {
        if let Ok(to) = resp.to_header() {
            if let Ok(Some(tag)) = to.tag() {
                self.adopt_remote_tag(tag.value());
            }
        }
        let status = resp.status_code.code();
        self.emit(SessionEvent::Provisional { code: status });

        if !resp.body().is_empty() {
            let has_pending_local = self.inner.oa.lock().unwrap().pending_is_local() == Some(true);
            let next = if has_pending_local {
                SessionState::UacEarlyWithAnswer
            } else {
                SessionState::UacEarlyWithOffer
            };
            self.transition(next);
            self.emit(SessionEvent::EarlyMedia {
                sdp: resp.body().clone(),
            });
        } else if self.state() == SessionState::UacStart {
            self.transition(SessionState::UacEarly);
        }

        if header_contains_token(resp.headers(), "Require", "100rel") {
            if let Err(e) = self.send_prack(resp).await {
                warn!("failed to PRACK reliable provisional: {}", e);
            }
        }
    }

    /// PRACK a reliable provisional (RFC 3262). Duplicate and regressing
    /// RSeq values are ignored.
    async fn send_prack(&self, resp: &Response) -> Result<()> {
        let Some(rseq) = parse_rseq_header(resp.headers()) else {
            warn!("reliable provisional without RSeq on {}", self.id());
            return Ok(());
        };
        {
            let mut last = self.inner.last_rseq.lock().unwrap();
            if *last >= rseq {
                return Ok(());
            }
            *last = rseq;
        }
        let cseq_header = resp.cseq_header()?;
        let rack = format!("{} {} {}", rseq, cseq_header.seq()?, cseq_header.method()?);
        let mut headers = vec![Header::Other("RAck".into(), rack)];
        if self.inner.supports_100rel {
            headers.push(Header::Other("Supported".into(), "100rel".into()));
        }
        let prack = self
            .inner
            .dialog
            .make_request(Method::PRack, None, Some(headers), None)?;
        self.inner.dialog.do_request(prack).await?;
        Ok(())
    }

    async fn on_uac_success(
        &self,
        resp: Response,
        tx: Option<&mut Transaction>,
    ) -> Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        // retransmitted 2xx for an established dialog: just re-ACK
        if matches!(
            self.state(),
            SessionState::Connected | SessionState::UacConnected
        ) {
            let cseq = *self.inner.invite_cseq.lock().unwrap();
            self.inner.dialog.send_ack(cseq, None).await.ok();
            return Ok(());
        }

        if let Ok(to) = resp.to_header() {
            if let Ok(Some(tag)) = to.tag() {
                self.adopt_remote_tag(tag.value());
            }
        }
        self.inner.dialog.apply_response_routing(&resp);
        if let Some(layer) = self.inner.layer.upgrade() {
            layer.register_session(self.clone());
        }

        let body = resp.body().clone();
        let invite_cseq = *self.inner.invite_cseq.lock().unwrap();
        let mut ack_body: Option<Vec<u8>> = None;

        let pending_local = self.inner.oa.lock().unwrap().pending_is_local();
        match pending_local {
            Some(true) => {
                if body.is_empty() {
                    // the offer went unanswered: confirm then abort
                    warn!("2xx without answer on {}", self.id());
                    self.send_uac_ack(tx, invite_cseq, None).await;
                    self.bye_with_reason(TerminatedReason::LocalError).await;
                    return Err(Error::NegotiationError(
                        "2xx carried no answer for the INVITE offer".to_string(),
                    ));
                }
                let (exchange, _) = self.inner.oa.lock().unwrap().apply_answer(body.clone())?;
                self.emit(SessionEvent::Answer {
                    exchange,
                    sdp: body.clone(),
                });
                self.notify_hold_if_needed(&body);
            }
            Some(false) => {
                // cannot happen on the UAC success path; treat as local error
                self.send_uac_ack(tx, invite_cseq, None).await;
                self.bye_with_reason(TerminatedReason::LocalError).await;
                return Err(Error::NegotiationError(
                    "unexpected remote offer state on 2xx".to_string(),
                ));
            }
            None => {
                if body.is_empty() {
                    self.send_uac_ack(tx, invite_cseq, None).await;
                    self.bye_with_reason(TerminatedReason::LocalError).await;
                    return Err(Error::NegotiationError(
                        "INVITE without offer answered without offer".to_string(),
                    ));
                }
                // offer came back in the 2xx; the answer rides the ACK
                self.inner.oa.lock().unwrap().offer_made(
                    OfferAnswerExchange::OfferInOk,
                    false,
                    body.clone(),
                )?;
                self.emit(SessionEvent::Offer {
                    exchange: OfferAnswerExchange::OfferInOk,
                    sdp: body.clone(),
                });
                let answer = self.wait_for_answer().await;
                match answer {
                    Some(answer) => {
                        self.inner.oa.lock().unwrap().apply_answer(answer.clone())?;
                        ack_body = Some(answer);
                    }
                    None => {
                        self.send_uac_ack(tx, invite_cseq, None).await;
                        self.bye_with_reason(TerminatedReason::LocalError).await;
                        return Err(Error::NegotiationError(
                            "no answer provided for offer in 2xx".to_string(),
                        ));
                    }
                }
            }
        }

        self.send_uac_ack(tx, invite_cseq, ack_body).await;
        self.transition(SessionState::UacConnected);
        self.transition(SessionState::Connected);

        if *self.inner.cancel_requested.lock().unwrap() {
            // the 200 beat our CANCEL: the dialog is confirmed and must
            // be released with BYE at once
            self.bye_with_reason(TerminatedReason::Cancelled).await;
            return Ok(());
        }
        self.emit(SessionEvent::Connected {
            sdp: if body.is_empty() { None } else { Some(body) },
        });
        Ok(())
    }

    async fn send_uac_ack(
        &self,
        tx: Option<&mut Transaction>,
        cseq: u32,
        body: Option<Vec<u8>>,
    ) {
        // ACK for the 2xx goes straight through the dialog; the
        // transaction is already terminated
        let _ = tx;
        if let Err(e) = self.inner.dialog.send_ack(cseq, body).await {
            warn!("failed to send ACK on {}: {}", self.id(), e);
        }
    }

    async fn wait_for_answer(&self) -> Option<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        self.inner.answer_waiter.lock().unwrap().replace(sender);
        let wait = self.inner.dialog.endpoint.option.t1x32();
        match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(answer)) => Some(answer),
            _ => None,
        }
    }

    /// Complete a remote-offer exchange: the answer rides the ACK (UAC,
    /// offer in 2xx) or the 200 (UAS re-INVITE/UPDATE paths use their own
    /// accept calls).
    pub fn provide_answer(&self, answer: Vec<u8>) -> Result<()> {
        if let Some(waiter) = self.inner.answer_waiter.lock().unwrap().take() {
            waiter
                .send(answer)
                .map_err(|_| Error::NegotiationError("answer no longer wanted".to_string()))?;
            return Ok(());
        }
        Err(Error::NegotiationError(
            "no exchange waiting for an answer".to_string(),
        ))
    }

    fn on_uac_failure(&self, status: u16) {
        let had_local_offer =
            self.inner.oa.lock().unwrap().pending_is_local() == Some(true);
        if had_local_offer {
            self.inner.oa.lock().unwrap().rollback();
        }
        let reason = match status {
            408 | 503 => TerminatedReason::NetworkError,
            487 => TerminatedReason::Cancelled,
            488 => {
                self.emit(SessionEvent::OfferRejected { code: status });
                TerminatedReason::Rejected
            }
            500..=599 => TerminatedReason::RemoteError,
            _ => TerminatedReason::Rejected,
        };
        self.terminate(reason);
    }

    fn adopt_remote_tag(&self, tag: &str) {
        let id_before = self.id();
        if id_before.to_tag == tag {
            return;
        }
        self.inner.dialog.update_remote_tag(tag);
        if let Some(layer) = self.inner.layer.upgrade() {
            layer.rekey_session(&id_before, self.clone());
        }
    }

    /// CANCEL the outstanding INVITE. Valid only while the client
    /// transaction can still be answered; ignored otherwise.
    pub async fn cancel(&self) -> Result<()> {
        if !self.state().is_early_uac() {
            debug!("cancel ignored in state {}", self.state());
            return Ok(());
        }
        {
            let mut flag = self.inner.cancel_requested.lock().unwrap();
            if *flag {
                return Ok(());
            }
            *flag = true;
        }
        let cancel = make_cancel(&self.inner.dialog.initial_request)?;
        let mut tx = self.inner.dialog.new_client_transaction(cancel)?;
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() != StatusCodeKind::Provisional {
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // UAS
    // ------------------------------------------------------------------

    /// Run the server INVITE transaction: 100 up front, then absorb
    /// CANCEL and retransmissions while the application decides.
    pub(crate) async fn process_uas_invite(&self, mut tx: Transaction) -> Result<()> {
        let offer = tx.original.body.clone();
        if !offer.is_empty() {
            self.inner.oa.lock().unwrap().offer_made(
                OfferAnswerExchange::OfferInInvite,
                false,
                offer.clone(),
            )?;
            self.transition(SessionState::UasOffer);
            self.notify_hold_if_needed(&offer);
        }
        self.inner
            .server_tx_sender
            .lock()
            .unwrap()
            .replace(tx.tu_sender.clone());

        tx.reply(StatusCode::Trying).await.ok();

        let from = tx
            .original
            .from_header()
            .map(|f| f.value().to_string())
            .unwrap_or_default();
        self.emit(SessionEvent::NewSession {
            incoming: true,
            from,
            offer: if offer.is_empty() { None } else { Some(offer.clone()) },
        });
        if !offer.is_empty() {
            self.emit(SessionEvent::Offer {
                exchange: OfferAnswerExchange::OfferInInvite,
                sdp: offer,
            });
        } else {
            self.emit(SessionEvent::OfferRequired);
        }

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                match req.method {
                    Method::Cancel => {
                        self.inner.oa.lock().unwrap().rollback();
                        self.terminate(TerminatedReason::Cancelled);
                    }
                    Method::Ack => {
                        // ACK to a non-2xx final; nothing further
                    }
                    _ => {}
                }
            }
        }
        self.inner.server_tx_sender.lock().unwrap().take();
        Ok(())
    }

    fn server_tx(&self) -> Result<TransactionEventSender> {
        self.inner
            .server_tx_sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                Error::DialogError("INVITE transaction no longer answerable".to_string(), self.id())
            })
    }

    /// Ring. With `early_sdp` the 180 carries early media (the answer is
    /// not committed until the final response).
    pub fn alert(&self, early_sdp: Option<Vec<u8>>) -> Result<()> {
        let sender = self.server_tx()?;
        let mut headers = vec![];
        if early_sdp.is_some() {
            headers.push(Header::ContentType("application/sdp".into()));
            self.transition(SessionState::UasEarlyOffer);
        }
        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            StatusCode::Ringing,
            Some(headers),
            early_sdp,
        );
        sender.send(TransactionEvent::Respond(resp))?;
        Ok(())
    }

    /// Answer the INVITE with a 200. With an inbound offer the `sdp` is
    /// the answer; without one it becomes our offer and the peer answers
    /// in the ACK.
    pub fn accept(&self, sdp: Option<Vec<u8>>) -> Result<()> {
        let sender = self.server_tx()?;
        let mut oa = self.inner.oa.lock().unwrap();
        let body = match (oa.has_pending(), sdp) {
            (true, Some(answer)) => {
                let (exchange, _) = oa.apply_answer(answer.clone())?;
                debug!("answering {} via {:?}", self.id(), exchange);
                answer
            }
            (true, None) => {
                return Err(Error::NegotiationError(
                    "accept requires an answer for the pending offer".to_string(),
                ));
            }
            (false, Some(offer)) => {
                oa.offer_made(OfferAnswerExchange::OfferInOk, true, offer.clone())?;
                offer
            }
            (false, None) => {
                return Err(Error::NegotiationError(
                    "accept without inbound offer requires an offer".to_string(),
                ));
            }
        };
        drop(oa);

        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            StatusCode::OK,
            Some(vec![Header::ContentType("application/sdp".into())]),
            Some(body),
        );
        sender.send(TransactionEvent::Respond(resp))?;
        self.transition(SessionState::UasAccepted);
        self.start_stale_ack_timer(false);
        Ok(())
    }

    pub fn reject(&self, code: StatusCode) -> Result<()> {
        let sender = self.server_tx()?;
        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            code,
            None,
            None,
        );
        sender.send(TransactionEvent::Respond(resp))?;
        self.inner.oa.lock().unwrap().rollback();
        self.terminate(TerminatedReason::Rejected);
        Ok(())
    }

    /// 302 the caller elsewhere; only meaningful before the final
    /// response.
    pub fn redirect(&self, contact: rsip::Uri) -> Result<()> {
        let sender = self.server_tx()?;
        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            StatusCode::MovedTemporarily,
            Some(vec![rsip::typed::Contact {
                display_name: None,
                uri: contact,
                params: vec![],
            }
            .into()]),
            None,
        );
        sender.send(TransactionEvent::Respond(resp))?;
        self.inner.oa.lock().unwrap().rollback();
        self.terminate(TerminatedReason::Referred);
        Ok(())
    }

    /// No ACK within 32*T1 of our 2xx: BYE and report. Initial accepts
    /// time out as stale calls, re-INVITE accepts as stale re-INVITEs.
    fn start_stale_ack_timer(&self, reinvite: bool) {
        let session = self.clone();
        let wait = self.inner.dialog.endpoint.option.t1x32();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let state = session.state();
            if matches!(state, SessionState::UasAccepted | SessionState::ReceivedReinvite) {
                session.emit(SessionEvent::StaleCallTimeout);
                let reason = if reinvite {
                    TerminatedReason::StaleReInvite
                } else {
                    TerminatedReason::Ended
                };
                session.bye_with_reason(reason).await;
            }
        });
    }

    /// ACK landed (dispatched here by the dialog layer since a 2xx ACK
    /// matches no transaction).
    pub(crate) async fn handle_ack(&self, req: Request) {
        let state = self.state();
        match state {
            SessionState::UasAccepted | SessionState::ReceivedReinvite => {
                let pending_local = self.inner.oa.lock().unwrap().pending_is_local();
                if pending_local == Some(true) {
                    let body = req.body.clone();
                    if body.is_empty() {
                        warn!("ACK without required answer on {}", self.id());
                        self.bye_with_reason(TerminatedReason::LocalError).await;
                        return;
                    }
                    let answer_result = self.inner.oa.lock().unwrap().apply_answer(body.clone());
                    match answer_result {
                        Ok((exchange, _)) => {
                            self.emit(SessionEvent::Answer {
                                exchange,
                                sdp: body,
                            });
                        }
                        Err(e) => {
                            warn!("negotiation failed in ACK on {}: {}", self.id(), e);
                            self.bye_with_reason(TerminatedReason::LocalError).await;
                            return;
                        }
                    }
                }
                self.transition(SessionState::Connected);
                self.emit(SessionEvent::ConnectedConfirmed);
            }
            _ => {
                debug!("ignoring ACK in state {}", state);
            }
        }
    }

    // ------------------------------------------------------------------
    // connected-state operations
    // ------------------------------------------------------------------

    pub async fn bye(&self) -> Result<()> {
        self.bye_with_reason(TerminatedReason::Ended).await;
        Ok(())
    }

    async fn bye_with_reason(&self, reason: TerminatedReason) {
        if self.is_terminated() {
            return;
        }
        {
            let mut sent = self.inner.bye_sent.lock().unwrap();
            if *sent {
                return;
            }
            *sent = true;
        }
        let request = match self.inner.dialog.make_request(Method::Bye, None, None, None) {
            Ok(request) => request,
            Err(e) => {
                warn!("failed to build BYE on {}: {}", self.id(), e);
                self.terminate(TerminatedReason::LocalError);
                return;
            }
        };
        if let Err(e) = self.inner.dialog.do_request(request).await {
            info!("BYE failed on {}: {}", self.id(), e);
        }
        self.terminate(reason);
    }

    /// Re-INVITE with a fresh offer. Retries once through 491 glare with
    /// a 0..2s backoff (RFC 3261 14.1).
    pub async fn reinvite(&self, offer: Vec<u8>) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(Error::DialogError(
                format!("cannot re-INVITE in state {}", self.state()),
                self.id(),
            ));
        }
        self.inner.oa.lock().unwrap().offer_made(
            OfferAnswerExchange::OfferInReinvite,
            true,
            offer.clone(),
        )?;
        self.transition(SessionState::SentReinvite);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let seq = self.inner.dialog.increment_local_seq();
            let request = self.inner.dialog.make_request(
                Method::Invite,
                Some(seq),
                Some(vec![Header::ContentType("application/sdp".into())]),
                Some(offer.clone()),
            )?;
            let resp = self.inner.dialog.do_request(request).await?;
            let Some(resp) = resp else {
                self.inner.oa.lock().unwrap().rollback();
                self.terminate(TerminatedReason::NetworkError);
                return Err(Error::DialogError(
                    "re-INVITE got no response".to_string(),
                    self.id(),
                ));
            };
            match resp.status_code {
                StatusCode::OK => {
                    let body = resp.body().clone();
                    *self.inner.invite_cseq.lock().unwrap() = seq;
                    self.inner.dialog.send_ack(seq, None).await.ok();
                    if body.is_empty() {
                        self.inner.oa.lock().unwrap().rollback();
                        self.bye_with_reason(TerminatedReason::LocalError).await;
                        return Err(Error::NegotiationError(
                            "re-INVITE 200 carried no answer".to_string(),
                        ));
                    }
                    let (exchange, _) =
                        self.inner.oa.lock().unwrap().apply_answer(body.clone())?;
                    self.transition(SessionState::Connected);
                    self.emit(SessionEvent::Answer {
                        exchange,
                        sdp: body,
                    });
                    return Ok(());
                }
                StatusCode::RequestPending if attempts < 2 => {
                    // glare: back off up to two seconds and try again
                    let backoff = Duration::from_millis(rand_backoff_ms());
                    debug!("491 glare on {}, retrying in {:?}", self.id(), backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                StatusCode::NotAcceptableHere | StatusCode::NotAcceptable => {
                    let status = resp.status_code.code();
                    self.inner.oa.lock().unwrap().rollback();
                    self.transition(SessionState::Connected);
                    self.emit(SessionEvent::OfferRejected { code: status });
                    return Ok(());
                }
                StatusCode::CallTransactionDoesNotExist => {
                    self.inner.oa.lock().unwrap().rollback();
                    self.terminate(TerminatedReason::RemoteError);
                    return Ok(());
                }
                _ => {
                    let status = resp.status_code.code();
                    self.inner.oa.lock().unwrap().rollback();
                    self.transition(SessionState::Connected);
                    self.emit(SessionEvent::OfferRejected { code: status });
                    return Ok(());
                }
            }
        }
    }

    /// UPDATE with an offer (RFC 3311). Same glare handling as
    /// re-INVITE, without the ACK leg.
    pub async fn update(&self, offer: Vec<u8>) -> Result<()> {
        let state = self.state();
        if state != SessionState::Connected && !state.is_early_uac() {
            return Err(Error::DialogError(
                format!("cannot UPDATE in state {}", state),
                self.id(),
            ));
        }
        self.inner.oa.lock().unwrap().offer_made(
            OfferAnswerExchange::OfferInUpdate,
            true,
            offer.clone(),
        )?;
        *self.inner.resume_state.lock().unwrap() = state;
        self.transition(SessionState::SentUpdate);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = self.inner.dialog.make_request(
                Method::Update,
                None,
                Some(vec![Header::ContentType("application/sdp".into())]),
                Some(offer.clone()),
            )?;
            let resp = self.inner.dialog.do_request(request).await?;
            let Some(resp) = resp else {
                self.inner.oa.lock().unwrap().rollback();
                self.terminate(TerminatedReason::NetworkError);
                return Ok(());
            };
            match resp.status_code {
                StatusCode::OK => {
                    let body = resp.body().clone();
                    let resume = *self.inner.resume_state.lock().unwrap();
                    if body.is_empty() {
                        self.inner.oa.lock().unwrap().rollback();
                        self.transition(resume);
                        self.emit(SessionEvent::OfferRejected { code: 200 });
                        return Ok(());
                    }
                    let (exchange, _) =
                        self.inner.oa.lock().unwrap().apply_answer(body.clone())?;
                    self.transition(resume);
                    self.emit(SessionEvent::Answer {
                        exchange,
                        sdp: body,
                    });
                    return Ok(());
                }
                StatusCode::RequestPending if attempts < 2 => {
                    let backoff = Duration::from_millis(rand_backoff_ms());
                    debug!("491 glare on {}, retrying in {:?}", self.id(), backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                _ => {
                    let status = resp.status_code.code();
                    let resume = *self.inner.resume_state.lock().unwrap();
                    self.inner.oa.lock().unwrap().rollback();
                    self.transition(resume);
                    self.emit(SessionEvent::OfferRejected { code: status });
                    return Ok(());
                }
            }
        }
    }

    pub async fn info(&self, content_type: &str, body: Vec<u8>) -> Result<()> {
        let request = self.inner.dialog.make_request(
            Method::Info,
            None,
            Some(vec![Header::ContentType(content_type.to_string().into())]),
            Some(body),
        )?;
        match self.inner.dialog.do_request(request).await? {
            Some(resp) if resp.status_code.kind() == StatusCodeKind::Successful => {
                self.emit(SessionEvent::InfoSuccess);
            }
            Some(resp) => {
                let status = resp.status_code.code();
                self.emit(SessionEvent::InfoFailure { code: status });
            }
            None => self.emit(SessionEvent::InfoFailure { code: 408 }),
        }
        Ok(())
    }

    pub async fn message(&self, body: Vec<u8>) -> Result<()> {
        let request = self.inner.dialog.make_request(
            Method::Message,
            None,
            Some(vec![Header::ContentType("text/plain".into())]),
            Some(body),
        )?;
        match self.inner.dialog.do_request(request).await? {
            Some(resp) if resp.status_code.kind() == StatusCodeKind::Successful => {
                self.emit(SessionEvent::MessageSuccess);
            }
            Some(resp) => {
                let status = resp.status_code.code();
                self.emit(SessionEvent::MessageFailure { code: status });
            }
            None => self.emit(SessionEvent::MessageFailure { code: 408 }),
        }
        Ok(())
    }

    /// Blind transfer (RFC 3515). The NOTIFY stream reports progress as
    /// ReferAccepted / ReferRejected events.
    pub async fn refer(&self, target: &str) -> Result<()> {
        self.refer_inner(target.to_string()).await
    }

    /// Attended transfer: REFER with an embedded Replaces header naming
    /// the other dialog.
    pub async fn refer_with_replaces(&self, target: &str, replaces: &DialogId) -> Result<()> {
        let refer_to = format!(
            "<{}?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}>",
            target, replaces.call_id, replaces.to_tag, replaces.from_tag
        );
        self.refer_inner(refer_to).await
    }

    async fn refer_inner(&self, refer_to: String) -> Result<()> {
        let headers = vec![
            Header::Other("Refer-To".into(), refer_to),
            Header::Other(
                "Referred-By".into(),
                self.inner.dialog.from.clone().untyped().value().to_string(),
            ),
        ];
        let request = self
            .inner
            .dialog
            .make_request(Method::Refer, None, Some(headers), None)?;
        match self.inner.dialog.do_request(request).await? {
            Some(resp) if resp.status_code.kind() == StatusCodeKind::Successful => {
                self.emit(SessionEvent::ReferAccepted);
            }
            Some(resp) => {
                let status = resp.status_code.code();
                self.emit(SessionEvent::ReferRejected { code: status });
            }
            None => self.emit(SessionEvent::ReferRejected { code: 408 }),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // in-dialog server side
    // ------------------------------------------------------------------

    /// Handle an in-dialog request. CSeq regressions are answered 500
    /// before anything else happens.
    pub(crate) async fn handle_request(&self, mut tx: Transaction) -> Result<()> {
        let cseq = tx.original.cseq_header()?.seq()?;
        if !self.inner.dialog.validate_remote_seq(cseq) {
            info!("CSeq regression on {}: {}", self.id(), cseq);
            tx.reply(StatusCode::ServerInternalError).await?;
            return Ok(());
        }
        match tx.original.method {
            Method::Bye => self.handle_bye(tx).await,
            Method::Invite => self.handle_reinvite(tx).await,
            Method::Update => self.handle_update(tx).await,
            Method::Info => self.handle_info(tx).await,
            Method::Message => self.handle_message(tx).await,
            Method::Refer => self.handle_refer(tx).await,
            Method::Notify => self.handle_notify(tx).await,
            Method::Options => {
                tx.reply(StatusCode::OK).await?;
                Ok(())
            }
            Method::PRack => {
                tx.reply(StatusCode::OK).await?;
                Ok(())
            }
            _ => {
                tx.reply(StatusCode::MethodNotAllowed).await?;
                Ok(())
            }
        }
    }

    async fn handle_bye(&self, mut tx: Transaction) -> Result<()> {
        info!("received BYE on {}", self.id());
        tx.reply(StatusCode::OK).await?;
        self.terminate(TerminatedReason::PeerEnded);
        Ok(())
    }

    async fn handle_reinvite(&self, mut tx: Transaction) -> Result<()> {
        let state = self.state();
        let glare = self.inner.oa.lock().unwrap().has_pending()
            || !matches!(state, SessionState::Connected);
        if glare {
            debug!("re-INVITE glare on {} in {}", self.id(), state);
            tx.reply(StatusCode::RequestPending).await?;
            return Ok(());
        }
        let offer = tx.original.body.clone();
        *self.inner.invite_cseq.lock().unwrap() = tx.original.cseq_header()?.seq()?;
        self.transition(SessionState::ReceivedReinvite);
        self.inner
            .server_tx_sender
            .lock()
            .unwrap()
            .replace(tx.tu_sender.clone());

        if offer.is_empty() {
            self.emit(SessionEvent::OfferRequired);
        } else {
            self.inner.oa.lock().unwrap().offer_made(
                OfferAnswerExchange::OfferInReinvite,
                false,
                offer.clone(),
            )?;
            self.notify_hold_if_needed(&offer);
            self.emit(SessionEvent::Offer {
                exchange: OfferAnswerExchange::OfferInReinvite,
                sdp: offer,
            });
        }

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = tx.receive().await {
                if let SipMessage::Request(req) = msg {
                    if req.method == Method::Cancel {
                        session.inner.oa.lock().unwrap().rollback();
                        session.transition(SessionState::Connected);
                    }
                }
            }
            session.inner.server_tx_sender.lock().unwrap().take();
        });
        Ok(())
    }

    /// Answer an inbound re-INVITE. With a pending remote offer `sdp` is
    /// the answer; for an offerless re-INVITE it is our offer and the
    /// answer arrives in the ACK.
    pub fn accept_reinvite(&self, sdp: Vec<u8>) -> Result<()> {
        if self.state() != SessionState::ReceivedReinvite {
            return Err(Error::DialogError(
                format!("no re-INVITE to accept in state {}", self.state()),
                self.id(),
            ));
        }
        let sender = self.server_tx()?;
        {
            let mut oa = self.inner.oa.lock().unwrap();
            if oa.has_pending() {
                let (exchange, _) = oa.apply_answer(sdp.clone())?;
                debug!("answering re-INVITE on {} via {:?}", self.id(), exchange);
            } else {
                oa.offer_made(OfferAnswerExchange::OfferInOk, true, sdp.clone())?;
            }
        }
        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            StatusCode::OK,
            Some(vec![Header::ContentType("application/sdp".into())]),
            Some(sdp),
        );
        sender.send(TransactionEvent::Respond(resp))?;
        self.start_stale_ack_timer(true);
        Ok(())
    }

    pub fn reject_reinvite(&self, code: StatusCode) -> Result<()> {
        if self.state() != SessionState::ReceivedReinvite {
            return Err(Error::DialogError(
                format!("no re-INVITE to reject in state {}", self.state()),
                self.id(),
            ));
        }
        let sender = self.server_tx()?;
        let resp = self.inner.dialog.make_response(
            &self.inner.dialog.initial_request,
            code,
            None,
            None,
        );
        sender.send(TransactionEvent::Respond(resp))?;
        self.inner.oa.lock().unwrap().rollback();
        self.transition(SessionState::Connected);
        Ok(())
    }

    async fn handle_update(&self, mut tx: Transaction) -> Result<()> {
        let offer = tx.original.body.clone();
        if offer.is_empty() {
            // target refresh only
            tx.reply(StatusCode::OK).await?;
            return Ok(());
        }
        let glare = self.inner.oa.lock().unwrap().has_pending();
        if glare {
            debug!("UPDATE glare on {}", self.id());
            tx.reply(StatusCode::RequestPending).await?;
            return Ok(());
        }
        let state = self.state();
        *self.inner.resume_state.lock().unwrap() = state;
        self.inner.oa.lock().unwrap().offer_made(
            OfferAnswerExchange::OfferInUpdate,
            false,
            offer.clone(),
        )?;
        self.transition(SessionState::ReceivedUpdate);
        self.inner
            .update_tx_sender
            .lock()
            .unwrap()
            .replace((tx.tu_sender.clone(), tx.original.clone()));
        self.notify_hold_if_needed(&offer);
        self.emit(SessionEvent::Offer {
            exchange: OfferAnswerExchange::OfferInUpdate,
            sdp: offer,
        });

        let session = self.clone();
        tokio::spawn(async move {
            while tx.receive().await.is_some() {}
            session.inner.update_tx_sender.lock().unwrap().take();
        });
        Ok(())
    }

    /// Answer an inbound UPDATE offer with a 200 carrying the answer.
    pub fn accept_update(&self, answer: Vec<u8>) -> Result<()> {
        if self.state() != SessionState::ReceivedUpdate {
            return Err(Error::DialogError(
                format!("no UPDATE to accept in state {}", self.state()),
                self.id(),
            ));
        }
        let (sender, request) = self
            .inner
            .update_tx_sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                Error::DialogError("UPDATE transaction gone".to_string(), self.id())
            })?;
        let (exchange, _) = self.inner.oa.lock().unwrap().apply_answer(answer.clone())?;
        debug!("answering UPDATE on {} via {:?}", self.id(), exchange);
        let resp = self.inner.dialog.make_response(
            &request,
            StatusCode::OK,
            Some(vec![Header::ContentType("application/sdp".into())]),
            Some(answer),
        );
        sender.send(TransactionEvent::Respond(resp))?;
        let resume = *self.inner.resume_state.lock().unwrap();
        self.transition(resume);
        Ok(())
    }

    async fn handle_info(&self, mut tx: Transaction) -> Result<()> {
        let body = tx.original.body.clone();
        let is_dtmf = tx
            .original
            .headers
            .iter()
            .any(|h| h.to_string().to_ascii_lowercase().contains("dtmf-relay"));
        tx.reply(StatusCode::OK).await?;
        if is_dtmf {
            if let Some(event) = parse_dtmf_relay(&body) {
                self.emit(event);
                return Ok(());
            }
        }
        self.emit(SessionEvent::Info { body });
        Ok(())
    }

    async fn handle_message(&self, mut tx: Transaction) -> Result<()> {
        let body = tx.original.body.clone();
        tx.reply(StatusCode::OK).await?;
        self.emit(SessionEvent::MessageReceived { body });
        Ok(())
    }

    async fn handle_refer(&self, mut tx: Transaction) -> Result<()> {
        let target = tx.original.headers.iter().find_map(|h| {
            let line = h.to_string();
            let (k, v) = line.split_once(':')?;
            if k.trim().eq_ignore_ascii_case("Refer-To") {
                Some(v.trim().to_string())
            } else {
                None
            }
        });
        match target {
            Some(target) => {
                tx.reply(StatusCode::Accepted).await?;
                self.emit(SessionEvent::Refer { target });
            }
            None => {
                tx.reply(StatusCode::BadRequest).await?;
            }
        }
        Ok(())
    }

    /// NOTIFY after a REFER we sent carries a sipfrag status line.
    async fn handle_notify(&self, mut tx: Transaction) -> Result<()> {
        let body = String::from_utf8_lossy(&tx.original.body).to_string();
        tx.reply(StatusCode::OK).await?;
        if let Some(status) = parse_sipfrag_status(&body) {
            if (200..300).contains(&status) {
                self.emit(SessionEvent::ReferAccepted);
            } else if status >= 400 {
                self.emit(SessionEvent::ReferRejected { code: status });
            }
        }
        Ok(())
    }

    /// Late or forked 2xx arriving outside any transaction.
    pub(crate) async fn handle_stray_response(&self, resp: Response) {
        if resp.status_code.kind() != StatusCodeKind::Successful {
            return;
        }
        let method = resp
            .cseq_header()
            .ok()
            .and_then(|c| c.method().ok());
        if method != Some(Method::Invite) {
            return;
        }
        if let Err(e) = self.on_uac_success(resp, None).await {
            warn!("failed to absorb stray 2xx on {}: {}", self.id(), e);
        }
    }

    fn notify_hold_if_needed(&self, remote_sdp: &[u8]) {
        if let Ok(text) = std::str::from_utf8(remote_sdp) {
            let direction = sdp::direction_of(text);
            self.emit(SessionEvent::RequestedHold {
                held: direction.is_hold(),
            });
        }
    }
}

fn rand_backoff_ms() -> u64 {
    use rand::Rng;
    rand::rng().random_range(0..2000)
}

fn parse_dtmf_relay(body: &[u8]) -> Option<SessionEvent> {
    let text = std::str::from_utf8(body).ok()?;
    let mut digit = None;
    let mut duration_ms = 250u32;
    for line in text.lines() {
        let (k, v) = line.split_once('=')?;
        match k.trim().to_ascii_lowercase().as_str() {
            "signal" => digit = v.trim().chars().next(),
            "duration" => duration_ms = v.trim().parse().unwrap_or(250),
            _ => {}
        }
    }
    Some(SessionEvent::Dtmf {
        digit: digit?,
        duration_ms,
        up: false,
    })
}

fn parse_sipfrag_status(body: &str) -> Option<u16> {
    let line = body.lines().find(|l| l.starts_with("SIP/2.0"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}
