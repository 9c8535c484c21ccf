use super::{sip_addr::SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::Result;
use rsip::SipMessage;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

type MessageReceiver = UnboundedReceiver<SipMessage>;
type MessageSender = UnboundedSender<SipMessage>;

struct ChannelInner {
    incoming: Mutex<Option<MessageReceiver>>,
    outgoing: MessageSender,
    addr: SipAddr,
    remote: SipAddr,
    cancel_token: CancellationToken,
}

/// In-memory connection used by tests and loopback wiring. A pair of
/// channel connections behaves like two UDP sockets pointed at each
/// other.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn create_connection(
        incoming: MessageReceiver,
        outgoing: MessageSender,
        addr: SipAddr,
        remote: SipAddr,
    ) -> Self {
        ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
                remote,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Two connections wired back to back: what one sends, the other's
    /// serve loop receives.
    pub fn create_pair(addr_a: SipAddr, addr_b: SipAddr) -> (Self, Self) {
        let (tx_ab, rx_ab) = unbounded_channel();
        let (tx_ba, rx_ba) = unbounded_channel();
        let a = Self::create_connection(rx_ba, tx_ab, addr_a.clone(), addr_b.clone());
        let b = Self::create_connection(rx_ab, tx_ba, addr_b, addr_a);
        (a, b)
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        self.inner.outgoing.send(msg).map_err(Into::into)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = incoming.ok_or_else(|| {
            crate::Error::Error("ChannelConnection::serve_loop called twice".to_string())
        })?;
        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => break,
                msg = incoming.recv() => {
                    match msg {
                        Some(msg) => sender.send(TransportEvent::Incoming(
                            msg,
                            SipConnection::Channel(self.clone()),
                            self.inner.remote.clone(),
                        ))?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
