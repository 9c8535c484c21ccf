use super::{
    endpoint::EndpointInnerRef,
    key::TransactionKey,
    message::{make_ack_for_error, make_response},
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionTimer, TransactionType,
};
use crate::{
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, trace, warn};

/// One RFC 3261 transaction. The owner drives it: a client calls
/// [`send`](Transaction::send) then loops on
/// [`receive`](Transaction::receive); a server receives it from the
/// endpoint, replies with [`respond`](Transaction::respond), and loops on
/// `receive` for retransmissions, ACK, and CANCEL.
///
/// Timers live in the endpoint's wheel and are delivered back through the
/// transaction's event channel, so the state machine runs entirely on the
/// owner's task.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Overrides the Request-URI as next hop, e.g. a strict route.
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_linger: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Idle
            }
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        Self {
            transaction_type,
            key,
            original,
            state,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_retransmit: None,
            timer_timeout: None,
            timer_linger: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        let tx = Transaction::new(tx_type, key, original, connection, endpoint_inner);
        tx.attach();
        tx
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let tx = Transaction::new(tx_type, key, original, connection, endpoint_inner);
        tx.attach();
        tx
    }

    fn attach(&self) {
        self.endpoint_inner.attach_transaction(
            &self.key,
            self.tu_sender.clone(),
            self.connection.as_ref(),
        );
    }

    fn is_reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// Send the original request (client transactions).
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        if self.connection.is_none() {
            let route_uri = self.destination.as_ref().map(rsip::Uri::from);
            let msg_len = self.original.to_string().len();
            let (connection, target) = self
                .endpoint_inner
                .selector
                .select(&self.original.uri, route_uri.as_ref(), msg_len)
                .await?;
            self.connection.replace(connection);
            self.destination.replace(target);
            self.attach();
        }

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection resolved".to_string(),
            self.key.clone(),
        ))?;

        match connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await
        {
            Ok(()) => {
                let next = match self.transaction_type {
                    TransactionType::ClientInvite => TransactionState::Calling,
                    _ => TransactionState::Trying,
                };
                self.transition(next)
            }
            Err(e) => {
                warn!("transport send failed for {}: {}", self.key, e);
                self.inform_transport_failure();
                Ok(())
            }
        }
    }

    /// Send a response (server transactions).
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection for response".to_string(),
            self.key.clone(),
        ))?;
        connection.send(response.clone().into(), None).await?;

        match response.status_code.kind() {
            StatusCodeKind::Provisional => {
                self.last_response.replace(response);
                if self.state == TransactionState::Trying {
                    self.transition(TransactionState::Proceeding)?;
                }
                Ok(())
            }
            StatusCodeKind::Successful => {
                self.last_response.replace(response);
                match self.transaction_type {
                    // a 2xx ends the INVITE server transaction at once;
                    // the TU owns 2xx retransmission and the ACK
                    TransactionType::ServerInvite => {
                        self.transition(TransactionState::Terminated)
                    }
                    _ => self.transition(TransactionState::Completed),
                }
            }
            _ => {
                self.last_response.replace(response);
                self.transition(TransactionState::Completed)
            }
        }
    }

    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        self.reply_with(status, vec![], None).await
    }

    pub async fn reply_with(
        &mut self,
        status: StatusCode,
        headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut resp = make_response(&self.original, status, body);
        for h in headers {
            resp.headers.unique_push(h);
        }
        self.respond(resp).await
    }

    /// ACK for a 2xx, sent over the transaction's connection. The ACK is
    /// a separate transaction per RFC 3261 but reuses the resolved route.
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "send_ack is only valid for client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection resolved".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack.replace(ack);
        self.transition(TransactionState::Terminated)?;
        Ok(())
    }

    /// Pull the next TU-visible message: responses for clients; ACK and
    /// CANCEL for servers. Returns `None` once the transaction
    /// terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    let visible = match msg {
                        SipMessage::Request(req) => {
                            self.on_received_request(req, connection).await
                        }
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    if let Some(msg) = visible {
                        return Some(msg);
                    }
                }
                TransactionEvent::Respond(resp) => {
                    self.respond(resp).await.ok();
                }
                TransactionEvent::Timer(timer) => {
                    self.on_timer(timer).await.ok();
                }
                TransactionEvent::TransportError => {
                    self.inform_transport_failure();
                }
                TransactionEvent::Terminate => return None,
            }
        }
        None
    }

    fn inform_tu_response(&mut self, response: Response) {
        self.tu_sender
            .send(TransactionEvent::Received(response.into(), None))
            .ok();
    }

    /// Surface a transport failure as a synthetic 503 and terminate.
    fn inform_transport_failure(&mut self) {
        let resp = self
            .endpoint_inner
            .synthesize_response(&self.original, StatusCode::ServiceUnavailable);
        if self.transaction_type.is_client() {
            self.inform_tu_response(resp);
        }
        self.transition(TransactionState::Terminated).ok();
    }

    async fn on_received_request(
        &mut self,
        req: Request,
        _connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if self.transaction_type.is_client() {
            return None;
        }
        match req.method {
            Method::Ack => {
                if self.transaction_type == TransactionType::ServerInvite {
                    match self.state {
                        TransactionState::Completed => {
                            self.transition(TransactionState::Confirmed).ok();
                            return Some(req.into());
                        }
                        TransactionState::Confirmed => {
                            // absorbed retransmission
                        }
                        _ => {}
                    }
                }
                None
            }
            Method::Cancel => {
                if self.transaction_type == TransactionType::ServerInvite
                    && matches!(
                        self.state,
                        TransactionState::Proceeding | TransactionState::Trying
                    )
                {
                    self.reply(StatusCode::RequestTerminated).await.ok();
                    return Some(req.into());
                }
                // CANCEL after a final response changes nothing
                None
            }
            _ if req.method == self.original.method => {
                // retransmission, replay whatever we last sent
                if let Some(last) = self.last_response.clone() {
                    if let Some(connection) = &self.connection {
                        connection.send(last.into(), None).await.ok();
                    }
                }
                None
            }
            _ => None,
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.transaction_type.is_client() {
            return None;
        }
        let kind = resp.status_code.kind();
        match self.state {
            TransactionState::Calling | TransactionState::Trying => match kind {
                StatusCodeKind::Provisional => {
                    self.transition(TransactionState::Proceeding).ok();
                    Some(resp.into())
                }
                _ => self.on_final_response(resp).await,
            },
            TransactionState::Proceeding => match kind {
                StatusCodeKind::Provisional => Some(resp.into()),
                _ => self.on_final_response(resp).await,
            },
            TransactionState::Completed => {
                // retransmitted final: re-ACK for INVITE, swallow
                if self.transaction_type == TransactionType::ClientInvite
                    && kind != StatusCodeKind::Successful
                {
                    if let Some(ack) = self.last_ack.clone() {
                        if let Some(connection) = &self.connection {
                            connection.send(ack.into(), self.destination.as_ref()).await.ok();
                        }
                    }
                }
                None
            }
            // synthetic 408/503 and retransmitted 2xx are queued behind
            // the terminal transition; the TU still needs to see them
            TransactionState::Terminated => Some(resp.into()),
            _ => None,
        }
    }

    async fn on_final_response(&mut self, resp: Response) -> Option<SipMessage> {
        let kind = resp.status_code.kind();
        self.last_response.replace(resp.clone());
        match self.transaction_type {
            TransactionType::ClientInvite => {
                if kind == StatusCodeKind::Successful {
                    // TU sends the ACK for a 2xx on its own
                    self.transition(TransactionState::Terminated).ok();
                } else {
                    // ACK the failure inside the transaction
                    if let Ok(ack) = make_ack_for_error(&self.original, &resp) {
                        if let Some(connection) = &self.connection {
                            connection
                                .send(ack.clone().into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                        self.last_ack.replace(ack);
                    }
                    self.transition(TransactionState::Completed).ok();
                }
            }
            TransactionType::ClientNonInvite => {
                self.transition(TransactionState::Completed).ok();
            }
            _ => {}
        }
        Some(resp.into())
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, duration) | TransactionTimer::TimerE(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Calling | TransactionState::Trying
                ) {
                    if let Some(connection) = &self.connection {
                        connection
                            .send(self.original.clone().into(), self.destination.as_ref())
                            .await?;
                    }
                    let (cap, rebuild): (_, fn(TransactionKey, std::time::Duration) -> TransactionTimer) =
                        match self.transaction_type {
                            TransactionType::ClientInvite => {
                                (self.endpoint_inner.option.t1x64(), TransactionTimer::TimerA)
                            }
                            _ => (self.endpoint_inner.option.t2, TransactionTimer::TimerE),
                        };
                    let next = (duration * 2).min(cap);
                    self.timer_retransmit.replace(
                        self.endpoint_inner.timers.timeout(next, rebuild(key, next)),
                    );
                }
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    debug!("transaction timeout: {}", self.key);
                    let timeout = self
                        .endpoint_inner
                        .synthesize_response(&self.original, StatusCode::RequestTimeout);
                    self.inform_tu_response(timeout);
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.state == TransactionState::Completed {
                    if let (Some(connection), Some(last)) =
                        (&self.connection, self.last_response.clone())
                    {
                        connection.send(last.into(), None).await?;
                    }
                    let next = (duration * 2).min(self.endpoint_inner.option.t2);
                    self.timer_retransmit.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerG(key, next)),
                    );
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    // no ACK ever arrived; the TU's stale timer handles BYE
                    debug!("timer H fired without ACK: {}", self.key);
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                if matches!(
                    self.state,
                    TransactionState::Completed | TransactionState::Confirmed
                ) {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerCleanup(_) => {}
        }
        Ok(())
    }

    fn cancel_timer(&mut self, slot: &mut Option<u64>) {
        if let Some(token) = slot.take() {
            self.endpoint_inner.timers.cancel(token);
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        let option = self.endpoint_inner.option.clone();
        let unreliable = !self.is_reliable();
        match state {
            TransactionState::Idle => {}
            TransactionState::Calling => {
                if unreliable {
                    let token = self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerA(self.key.clone(), option.t1),
                    );
                    self.timer_retransmit.replace(token);
                }
                let token = self
                    .endpoint_inner
                    .timers
                    .timeout(option.t1x64(), TransactionTimer::TimerB(self.key.clone()));
                self.timer_timeout.replace(token);
            }
            TransactionState::Trying => {
                if self.transaction_type == TransactionType::ClientNonInvite {
                    if unreliable {
                        let token = self.endpoint_inner.timers.timeout(
                            option.t1,
                            TransactionTimer::TimerE(self.key.clone(), option.t1),
                        );
                        self.timer_retransmit.replace(token);
                    }
                    let token = self
                        .endpoint_inner
                        .timers
                        .timeout(option.t1x64(), TransactionTimer::TimerF(self.key.clone()));
                    self.timer_timeout.replace(token);
                }
            }
            TransactionState::Proceeding => {
                let mut retransmit = self.timer_retransmit.take();
                self.cancel_timer(&mut retransmit);
            }
            TransactionState::Completed => {
                let mut retransmit = self.timer_retransmit.take();
                self.cancel_timer(&mut retransmit);
                let mut timeout = self.timer_timeout.take();
                self.cancel_timer(&mut timeout);
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // timer D: absorb response retransmissions
                        let wait = if unreliable {
                            option.t1x64()
                        } else {
                            std::time::Duration::ZERO
                        };
                        self.timer_linger.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(wait, TransactionTimer::TimerD(self.key.clone())),
                        );
                    }
                    TransactionType::ClientNonInvite => {
                        let wait = if unreliable {
                            option.t4
                        } else {
                            std::time::Duration::ZERO
                        };
                        self.timer_linger.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(wait, TransactionTimer::TimerK(self.key.clone())),
                        );
                    }
                    TransactionType::ServerInvite => {
                        if unreliable {
                            self.timer_retransmit.replace(self.endpoint_inner.timers.timeout(
                                option.t1,
                                TransactionTimer::TimerG(self.key.clone(), option.t1),
                            ));
                        }
                        self.timer_timeout.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(option.t1x64(), TransactionTimer::TimerH(self.key.clone())),
                        );
                    }
                    TransactionType::ServerNonInvite => {
                        let wait = if unreliable {
                            option.t1x64()
                        } else {
                            std::time::Duration::ZERO
                        };
                        self.timer_linger.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(wait, TransactionTimer::TimerJ(self.key.clone())),
                        );
                    }
                }
            }
            TransactionState::Confirmed => {
                let mut retransmit = self.timer_retransmit.take();
                self.cancel_timer(&mut retransmit);
                let mut timeout = self.timer_timeout.take();
                self.cancel_timer(&mut timeout);
                let wait = if unreliable {
                    option.t4
                } else {
                    std::time::Duration::ZERO
                };
                self.timer_linger.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(wait, TransactionTimer::TimerI(self.key.clone())),
                );
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        trace!("{} transition {} -> {}", self.key, self.state, state);
        self.state = state;
        Ok(())
    }

    fn cleanup_timers(&mut self) {
        let mut retransmit = self.timer_retransmit.take();
        self.cancel_timer(&mut retransmit);
        let mut timeout = self.timer_timeout.take();
        self.cancel_timer(&mut timeout);
        let mut linger = self.timer_linger.take();
        self.cancel_timer(&mut linger);
    }

    fn cleanup(&mut self) {
        if self.state == TransactionState::Terminated {
            return;
        }
        self.cleanup_timers();
        // keep the final response around so request retransmissions can
        // be replayed after the transaction object is gone
        let cached = match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                self.last_response.clone()
            }
            _ => None,
        };
        self.endpoint_inner.detach_transaction(&self.key, cached);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}
