use super::{
    key::{TransactionKey, TransactionRole},
    message::make_response,
    timer::TimerWheel,
    transaction::Transaction,
    EndpointEvent, EndpointEventReceiver, EndpointEventSender, TransactionEvent,
    TransactionEventSender, TransactionTimer, T1, T2, T4,
};
use crate::{
    transport::{
        SipAddr, SipConnection, TransportEvent, TransportReceiver, TransportSelector,
        TransportSender,
    },
    Result,
};
use rsip::{Method, Response, SipMessage, StatusCode};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const USER_AGENT: &str = "convostack/0.1";
const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// Timing knobs, RFC 3261 defaults. Tests shrink T1 to drive timeouts in
/// milliseconds instead of half-minutes.
#[derive(Clone, Debug)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub timer_interval: Duration,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: T1,
            t2: T2,
            t4: T4,
            timer_interval: TIMER_INTERVAL,
        }
    }
}

impl EndpointOption {
    pub fn t1x64(&self) -> Duration {
        self.t1 * 64
    }

    pub fn t1x32(&self) -> Duration {
        self.t1 * 32
    }
}

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: TimerWheel<TransactionTimer>,
    pub selector: TransportSelector,
    pub cancel_token: CancellationToken,

    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    transaction_connections: Mutex<HashMap<TransactionKey, SipAddr>>,
    finished_transactions: Mutex<HashMap<TransactionKey, Option<Response>>>,

    tu_sender: EndpointEventSender,
    transport_sender: TransportSender,
    transport_receiver: Mutex<Option<TransportReceiver>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The transaction-layer endpoint: demultiplexes inbound traffic onto
/// transactions, runs their timers, and hands everything that is not a
/// transaction's business (new requests, 2xx ACKs, stray responses) up
/// to the dialog layer.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
    incoming: Mutex<Option<EndpointEventReceiver>>,
}

pub struct EndpointBuilder {
    user_agent: String,
    selector: Option<TransportSelector>,
    cancel_token: Option<CancellationToken>,
    option: EndpointOption,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            selector: None,
            cancel_token: None,
            option: EndpointOption::default(),
        }
    }

    pub fn user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn transport_selector(&mut self, selector: TransportSelector) -> &mut Self {
        self.selector.replace(selector);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn option(&mut self, option: EndpointOption) -> &mut Self {
        self.option = option;
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let selector = self
            .selector
            .take()
            .unwrap_or_else(|| TransportSelector::new(cancel_token.child_token()));

        let (tu_sender, tu_receiver) = unbounded_channel();
        let (transport_sender, transport_receiver) = unbounded_channel();

        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent.clone(),
            option: self.option.clone(),
            timers: TimerWheel::new(),
            selector,
            cancel_token,
            transactions: Mutex::new(HashMap::new()),
            transaction_connections: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            tu_sender,
            transport_sender,
            transport_receiver: Mutex::new(Some(transport_receiver)),
        });

        Endpoint {
            inner,
            incoming: Mutex::new(Some(tu_receiver)),
        }
    }
}

impl Endpoint {
    /// Drive timers and transport demultiplexing until cancelled.
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        let timer_inner = self.inner.clone();
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            _ = timer_inner.process_timers() => {}
            _ = inner.process_transports() => {}
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.inner.cancel_token.cancel();
    }

    /// Take the stream of dialog-layer events. Single consumer.
    pub fn take_events(&self) -> Option<EndpointEventReceiver> {
        self.incoming.lock().unwrap().take()
    }

    pub fn client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        Ok(Transaction::new_client(key, request, self.inner.clone(), None))
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.inner.selector
    }
}

impl EndpointInner {
    pub fn transport_sender(&self) -> TransportSender {
        self.transport_sender.clone()
    }

    pub async fn start_transports(&self) -> Result<()> {
        self.selector.serve_listens(self.transport_sender.clone()).await
    }

    pub(crate) fn attach_transaction(
        &self,
        key: &TransactionKey,
        sender: TransactionEventSender,
        connection: Option<&SipConnection>,
    ) {
        trace!("attach transaction {}", key);
        self.transactions.lock().unwrap().insert(key.clone(), sender);
        if let Some(conn) = connection {
            if conn.is_stream() {
                self.transaction_connections
                    .lock()
                    .unwrap()
                    .insert(key.clone(), conn.get_addr().clone());
            }
        }
    }

    pub(crate) fn detach_transaction(
        &self,
        key: &TransactionKey,
        last_response: Option<Response>,
    ) {
        trace!("detach transaction {}", key);
        self.transactions.lock().unwrap().remove(key);
        self.transaction_connections.lock().unwrap().remove(key);

        if let Some(resp) = last_response {
            if self
                .finished_transactions
                .lock()
                .unwrap()
                .contains_key(key)
            {
                return;
            }
            self.timers
                .timeout(self.option.t1x64(), TransactionTimer::TimerCleanup(key.clone()));
            self.finished_transactions
                .lock()
                .unwrap()
                .insert(key.clone(), Some(resp));
        }
    }

    async fn process_timers(self: Arc<Self>) -> Result<()> {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.poll(Instant::now()) {
                if let TransactionTimer::TimerCleanup(key) = timer {
                    self.transactions.lock().unwrap().remove(&key);
                    self.finished_transactions.lock().unwrap().remove(&key);
                    continue;
                }
                let sender = self
                    .transactions
                    .lock()
                    .unwrap()
                    .get(timer.key())
                    .cloned();
                if let Some(sender) = sender {
                    if sender.send(TransactionEvent::Timer(timer)).is_err() {
                        // receiver dropped without terminating
                        warn!("transaction channel closed, detaching");
                    }
                }
            }
            tokio::time::sleep(self.option.timer_interval).await;
        }
        Ok(())
    }

    async fn process_transports(self: Arc<Self>) -> Result<()> {
        let receiver = self.transport_receiver.lock().unwrap().take();
        let mut receiver = receiver
            .ok_or_else(|| crate::Error::EndpointError("transport loop started twice".into()))?;
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, source) => {
                    if let Err(e) = self.on_incoming(msg, connection, &source) {
                        info!("error handling incoming message from {}: {}", source, e);
                    }
                }
                TransportEvent::New(connection) => {
                    self.selector.inner.add_connection(connection);
                }
                TransportEvent::Closed(connection) => {
                    self.selector.inner.del_connection(connection.get_addr());
                    self.fail_transactions_on(connection.get_addr());
                }
            }
        }
        Ok(())
    }

    /// Every transaction bound to a torn-down stream gets a transport
    /// error, which it reports upward as a synthetic 503.
    fn fail_transactions_on(&self, addr: &SipAddr) {
        let keys: Vec<TransactionKey> = self
            .transaction_connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a)| **a == *addr)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            warn!("failing transaction on closed connection: {}", key);
            if let Some(sender) = self.transactions.lock().unwrap().get(&key) {
                sender.send(TransactionEvent::TransportError).ok();
            }
        }
    }

    fn on_incoming(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        source: &SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => self.on_incoming_request(req, connection, source),
            SipMessage::Response(resp) => self.on_incoming_response(resp),
        }
    }

    fn on_incoming_request(
        self: &Arc<Self>,
        req: rsip::Request,
        connection: SipConnection,
        source: &SipAddr,
    ) -> Result<()> {
        trace!("incoming request {} from {}", req.method(), source);
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;

        match req.method() {
            Method::Ack => {
                // ACK for a non-2xx matches the INVITE transaction by
                // branch; ACK for a 2xx matches nothing and belongs to
                // the dialog.
                let invite_key = key.with_method(Method::Invite);
                let sender = self.transactions.lock().unwrap().get(&invite_key).cloned();
                match sender {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(req.into(), Some(connection)))
                            .ok();
                    }
                    None => {
                        self.tu_sender
                            .send(EndpointEvent::Ack(req, Some(connection)))?;
                    }
                }
                return Ok(());
            }
            Method::Cancel => {
                let invite_key = key.with_method(Method::Invite);
                let sender = self.transactions.lock().unwrap().get(&invite_key).cloned();
                match sender {
                    Some(sender) => {
                        self.reply_out_of_transaction(&connection, &req, StatusCode::OK)?;
                        sender
                            .send(TransactionEvent::Received(req.into(), Some(connection)))
                            .ok();
                    }
                    None => {
                        self.reply_out_of_transaction(
                            &connection,
                            &req,
                            StatusCode::CallTransactionDoesNotExist,
                        )?;
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        let sender = self.transactions.lock().unwrap().get(&key).cloned();
        if let Some(sender) = sender {
            // retransmission of a request with a live transaction
            sender
                .send(TransactionEvent::Received(req.into(), Some(connection)))
                .ok();
            return Ok(());
        }

        if let Some(Some(last_response)) = self.finished_transactions.lock().unwrap().get(&key) {
            debug!("replaying cached final response for {}", key);
            let resp = last_response.clone();
            let conn = connection.clone();
            tokio::spawn(async move {
                conn.send(resp.into(), None).await.ok();
            });
            return Ok(());
        }

        let tx = Transaction::new_server(key, req, self.clone(), Some(connection));
        self.tu_sender.send(EndpointEvent::Request(tx))?;
        Ok(())
    }

    fn on_incoming_response(&self, resp: Response) -> Result<()> {
        let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
        let sender = self.transactions.lock().unwrap().get(&key).cloned();
        match sender {
            Some(sender) => {
                sender
                    .send(TransactionEvent::Received(resp.into(), None))
                    .ok();
            }
            None => {
                if resp.status_code.kind() == rsip::StatusCodeKind::Provisional {
                    debug!("dropping stray provisional response {}", resp.status_code);
                } else {
                    // late or retransmitted final, typically a forked 2xx
                    self.tu_sender.send(EndpointEvent::StrayResponse(resp))?;
                }
            }
        }
        Ok(())
    }

    fn reply_out_of_transaction(
        &self,
        connection: &SipConnection,
        req: &rsip::Request,
        status: StatusCode,
    ) -> Result<()> {
        let resp = make_response(req, status, None);
        let conn = connection.clone();
        tokio::spawn(async move {
            conn.send(resp.into(), None).await.ok();
        });
        Ok(())
    }

    /// Build a Via for outbound requests from the first configured
    /// transport, or the given address.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .selector
                .get_addrs()
                .into_iter()
                .next()
                .ok_or_else(|| crate::Error::EndpointError("no transport configured".into()))?,
        };
        let transport = addr.r#type.clone().unwrap_or(rsip::transport::Transport::Udp);
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport,
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![branch.unwrap_or_else(super::make_via_branch)],
        })
    }

    pub fn tu_event_sender(&self) -> EndpointEventSender {
        self.tu_sender.clone()
    }
}

impl EndpointInner {
    /// Synthetic response used for locally generated failures (408 on
    /// timer B/F, 503 on transport errors).
    pub fn synthesize_response(
        &self,
        req: &rsip::Request,
        status: StatusCode,
    ) -> Response {
        make_response(req, status, None)
    }
}
