use super::{
    sip_addr::SipAddr,
    stream::StreamInner,
    SipConnection, TransportSender,
};
use crate::Result;
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner =
    StreamInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let stream = TcpStream::connect(socket_addr).await?;

        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: SipConnection::resolve_bind_address(stream.local_addr()?).into(),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let connection = TcpConnection {
            inner: Arc::new(StreamInner::new(
                local_addr.clone(),
                remote.clone(),
                read_half,
                write_half,
            )),
        };
        info!("created TCP client connection: {} -> {}", local_addr, remote);
        Ok(connection)
    }

    pub fn from_stream(stream: TcpStream, local_addr: SipAddr) -> Result<Self> {
        let remote_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: stream.peer_addr()?.into(),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let connection = TcpConnection {
            inner: Arc::new(StreamInner::new(
                local_addr,
                remote_addr.clone(),
                read_half,
                write_half,
            )),
        };
        info!(
            "created TCP server connection: {} <- {}",
            connection.inner.local_addr, remote_addr
        );
        Ok(connection)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .serve_loop(sender, SipConnection::Tcp(self.clone()))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inner.local_addr, self.inner.remote_addr)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
