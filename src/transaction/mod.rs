use crate::transport::SipConnection;
use key::TransactionKey;
use rsip::{Request, Response, SipMessage};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;
pub use endpoint::{Endpoint, EndpointBuilder};

#[cfg(test)]
mod tests;

pub const BRANCH_LEN: usize = 12;
pub const TAG_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;
pub const CNONCE_LEN: usize = 8;

/// RFC 3261 baseline timer values. `EndpointOption` lets tests compress
/// them.
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

/// Transaction states shared by the four RFC 3261 state machines.
///
/// Client INVITE: Calling -> Proceeding -> Completed -> Terminated.
/// Server INVITE: Proceeding -> Completed -> Confirmed -> Terminated.
/// Client and server non-INVITE: Trying -> Proceeding -> Completed ->
/// Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Idle => "Idle",
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }

    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ServerInvite
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::ClientInvite => "ClientInvite",
            TransactionType::ClientNonInvite => "ClientNonInvite",
            TransactionType::ServerInvite => "ServerInvite",
            TransactionType::ServerNonInvite => "ServerNonInvite",
        };
        f.write_str(name)
    }
}

/// The RFC 3261 section 17 timers. Retransmit timers carry their current
/// interval so each firing can double it.
#[derive(Debug)]
pub enum TransactionTimer {
    /// INVITE request retransmission (unreliable transports).
    TimerA(TransactionKey, Duration),
    /// INVITE transaction timeout, 64*T1.
    TimerB(TransactionKey),
    /// Wait for response retransmissions after a non-2xx final (client
    /// INVITE).
    TimerD(TransactionKey),
    /// Non-INVITE request retransmission, doubling up to T2.
    TimerE(TransactionKey, Duration),
    /// Non-INVITE transaction timeout, 64*T1.
    TimerF(TransactionKey),
    /// Retransmission of a non-2xx final response (server INVITE).
    TimerG(TransactionKey, Duration),
    /// Wait for ACK after a non-2xx final, 64*T1.
    TimerH(TransactionKey),
    /// Absorb ACK retransmissions once confirmed.
    TimerI(TransactionKey),
    /// Absorb request retransmissions after a non-INVITE final.
    TimerJ(TransactionKey),
    /// Wait after a non-INVITE final response (client).
    TimerK(TransactionKey),
    /// Drop the cached final response for a finished transaction.
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, d) => write!(f, "TimerA {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerB(key) => write!(f, "TimerB {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD {}", key),
            TransactionTimer::TimerE(key, d) => write!(f, "TimerE {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerF(key) => write!(f, "TimerF {}", key),
            TransactionTimer::TimerG(key, d) => write!(f, "TimerG {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerH(key) => write!(f, "TimerH {}", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI {}", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ {}", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK {}", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup {}", key),
        }
    }
}

/// Events delivered into a transaction's channel: matched wire traffic,
/// timer firings, a response handed over by the dialog layer, or the
/// terminal marker.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Respond(Response),
    Timer(TransactionTimer),
    TransportError,
    Terminate,
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Events from the endpoint core up to the transaction user (the dialog
/// layer).
pub enum EndpointEvent {
    /// A new server transaction for an out-of-transaction request.
    Request(transaction::Transaction),
    /// ACK to a 2xx, which never matches a transaction (RFC 3261 17.1.1.1)
    /// and goes straight to the dialog.
    Ack(Request, Option<SipConnection>),
    /// A response that matched no live transaction, e.g. a forked or
    /// retransmitted 2xx after the INVITE transaction terminated.
    StrayResponse(Response),
}

pub type EndpointEventReceiver = UnboundedReceiver<EndpointEvent>;
pub type EndpointEventSender = UnboundedSender<EndpointEvent>;

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TAG_LEN).into()
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!("{}@{}", random_text(CALL_ID_LEN), domain.unwrap_or("localhost")).into()
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}
