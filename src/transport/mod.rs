use rsip::SipMessage;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod channel;
pub mod connection;
pub mod selector;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
#[cfg(feature = "rustls")]
pub mod tls;
pub mod udp;

#[cfg(test)]
mod tests;

pub use connection::SipConnection;
pub use selector::TransportSelector;
pub use sip_addr::SipAddr;

/// Largest request that is still sent over UDP before the stack switches
/// to a stream transport (RFC 3261 18.1.1 says 200 bytes less than the
/// path MTU, 1300 when the MTU is unknown).
pub const UDP_MAX_MESSAGE_SIZE: usize = 1300;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Events flowing from the individual connections to the endpoint core.
#[derive(Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;
