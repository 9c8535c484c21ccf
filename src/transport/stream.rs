use super::{
    sip_addr::SipAddr, SipConnection, TransportEvent, TransportSender, KEEPALIVE_REQUEST,
    KEEPALIVE_RESPONSE,
};
use crate::Result;
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages out of a byte stream. Relies on the blank line
/// terminating the header section; bodies are carried verbatim since
/// `rsip` parses Content-Length itself.
pub struct SipCodec {
    max_size: usize,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_SIP_MESSAGE_SIZE,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Err(crate::Error::Keepalive);
        }
        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Err(crate::Error::Keepalive);
        }

        let data = match std::str::from_utf8(&src[..]) {
            Ok(s) => s,
            Err(_) => {
                if src.len() > self.max_size {
                    return Err(crate::Error::Error("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        if !data.contains("\r\n\r\n") {
            if src.len() > self.max_size {
                return Err(crate::Error::Error("SIP message too large".to_string()));
            }
            return Ok(None);
        }

        match SipMessage::try_from(data) {
            Ok(msg) => {
                let body_len = match &msg {
                    SipMessage::Request(r) => r.body().len(),
                    SipMessage::Response(r) => r.body().len(),
                };
                let consumed = data.find("\r\n\r\n").unwrap_or(data.len() - 4) + 4 + body_len;
                src.advance(consumed.min(src.len()));
                Ok(Some(msg))
            }
            Err(e) => {
                // resync at the next header/body boundary
                if let Some(pos) = data[1..].find("\r\n\r\n") {
                    src.advance(pos + 5);
                } else {
                    src.clear();
                }
                Err(crate::Error::Error(format!(
                    "failed to parse SIP message: {}",
                    e
                )))
            }
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

/// Shared read/write machinery for TCP and TLS connections.
pub struct StreamInner<R, W> {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    read_half: Mutex<Option<R>>,
    write_half: Arc<Mutex<W>>,
}

impl<R, W> StreamInner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Arc::new(Mutex::new(write_half)),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let data = msg.to_string();
        let mut lock = self.write_half.lock().await;
        lock.write_all(data.as_bytes()).await?;
        lock.flush().await?;
        Ok(())
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        lock.write_all(data).await?;
        lock.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        lock.shutdown().await?;
        Ok(())
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let read_half = self.read_half.lock().await.take();
        let mut read_half = read_half.ok_or_else(|| {
            crate::Error::Error("stream serve_loop called twice".to_string())
        })?;

        let transport = self
            .remote_addr
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Tcp);
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("stream closed by peer: {}", self.remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(msg)) => {
                                let msg = match self.remote_addr.get_socketaddr().ok() {
                                    Some(socket_addr) => SipConnection::update_msg_received(
                                        msg,
                                        socket_addr,
                                        transport,
                                    )?,
                                    None => msg,
                                };
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    self.remote_addr.clone(),
                                ))?;
                            }
                            Ok(None) => break,
                            Err(crate::Error::Keepalive) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Err(e) => {
                                warn!("error decoding from {}: {}", self.remote_addr, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("error reading from {}: {}", self.remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }
}
