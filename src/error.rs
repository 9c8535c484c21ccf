use crate::{dialog::DialogId, transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(#[from] rsip::Error),

    #[error("SDP error: {0}")]
    SdpError(String),

    #[error("transport layer error: {0}: {1}")]
    TransportLayerError(String, SipAddr),

    #[error("transaction error: {0}: {1}")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0}: {1}")]
    DialogError(String, DialogId),

    #[error("offer/answer violation: {0}")]
    NegotiationError(String),

    #[error("conversation error: {0}")]
    ConversationError(String),

    #[error("media url error: {0}")]
    MediaUrlError(String),

    #[error("security error during {0}: {1}")]
    SecurityError(&'static str, String),

    #[error("endpoint error: {0}")]
    EndpointError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[cfg(feature = "rustls")]
    #[error("TLS error: {0}")]
    TlsError(#[from] tokio_rustls::rustls::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    // stream codec internal marker, never surfaced to callers
    #[error("keepalive")]
    Keepalive,

    #[error("{0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
