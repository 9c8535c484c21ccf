use super::{sip_addr::SipAddr, tcp::TcpConnection, SipConnection, TransportEvent, TransportSender};
use crate::Result;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};

struct TcpListenerInner {
    local_addr: SipAddr,
    external: Option<SipAddr>,
}

#[derive(Clone)]
pub struct TcpListenerConnection {
    inner: Arc<TcpListenerInner>,
}

impl TcpListenerConnection {
    pub fn new(local_addr: SipAddr, external: Option<SocketAddr>) -> Self {
        TcpListenerConnection {
            inner: Arc::new(TcpListenerInner {
                local_addr,
                external: external.map(|addr| SipAddr {
                    r#type: Some(rsip::transport::Transport::Tcp),
                    addr: addr.into(),
                }),
            }),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.inner.external.as_ref().unwrap_or(&self.inner.local_addr)
    }

    /// Accepts inbound streams. Each accepted connection is announced with
    /// [`TransportEvent::New`] and served on its own task with the same
    /// event sender, so the endpoint can register and later fail it.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let listener = TcpListener::bind(self.inner.local_addr.get_socketaddr()?).await?;
        let local_addr = self.get_addr().clone();
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    continue;
                }
            };
            let connection = match TcpConnection::from_stream(stream, local_addr.clone()) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to wrap accepted stream: {}", e);
                    continue;
                }
            };
            info!(%remote_addr, "new inbound TCP connection");
            let sip_connection = SipConnection::Tcp(connection.clone());
            sender.send(TransportEvent::New(sip_connection.clone()))?;
            let conn_sender = sender.clone();
            tokio::spawn(async move {
                connection.serve_loop(conn_sender.clone()).await.ok();
                conn_sender.send(TransportEvent::Closed(sip_connection)).ok();
            });
        }
    }

    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
