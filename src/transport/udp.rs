use super::{sip_addr::SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

struct UdpInner {
    socket: UdpSocket,
    addr: SipAddr,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let advertised = external
            .unwrap_or_else(|| SipConnection::resolve_bind_address(socket.local_addr().unwrap_or(local)));
        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: advertised.into(),
        };
        let conn = UdpConnection {
            inner: Arc::new(UdpInner { socket, addr }),
        };
        info!("created UDP connection: {}", conn);
        Ok(conn)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn send(
        &self,
        msg: rsip::SipMessage,
        destination: Option<&SipAddr>,
    ) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.get_socketaddr()?,
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();
        trace!("sending {} bytes {} -> {}", buf.len(), self.get_addr(), target);
        self.inner
            .socket
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), self.get_addr().clone()))
            .map(|_| ())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, addr) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    break;
                }
            };

            // bare CRLF is a keepalive probe
            if len <= 4 && buf[..len].iter().all(|b| *b == b'\r' || *b == b'\n') {
                continue;
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!("ignoring non-utf8 datagram from {}: {}", addr, e);
                    continue;
                }
            };
            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("dropping unparsable message from {}: {}", addr, e);
                    continue;
                }
            };
            let msg = match SipConnection::update_msg_received(
                msg,
                addr,
                rsip::transport::Transport::Udp,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("dropping message with bad Via from {}: {}", addr, e);
                    continue;
                }
            };

            trace!("received {} bytes {} -> {}", len, addr, self.get_addr());
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                SipAddr {
                    r#type: Some(rsip::transport::Transport::Udp),
                    addr: addr.into(),
                },
            ))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
