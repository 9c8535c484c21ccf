use super::{
    sip_addr::SipAddr, stream::StreamInner, SipConnection, TransportEvent, TransportSender,
};
use crate::{Error, Result};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector,
};
use tracing::{info, warn};

/// PEM material for the TLS transport. The server side needs `cert` and
/// `key`; the client side trusts `ca_certs` (system roots are not
/// consulted).
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub ca_certs: Option<Vec<u8>>,
}

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;
type TlsServerStream = tokio_rustls::server::TlsStream<TcpStream>;

type TlsClientInner =
    StreamInner<tokio::io::ReadHalf<TlsClientStream>, tokio::io::WriteHalf<TlsClientStream>>;
type TlsServerInner =
    StreamInner<tokio::io::ReadHalf<TlsServerStream>, tokio::io::WriteHalf<TlsServerStream>>;

#[derive(Clone)]
enum TlsInner {
    Client(Arc<TlsClientInner>),
    Server(Arc<TlsServerInner>),
}

#[derive(Clone)]
pub struct TlsConnection {
    inner: TlsInner,
}

impl TlsConnection {
    pub async fn connect(remote: &SipAddr, config: &TlsConfig) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        if let Some(ca) = &config.ca_certs {
            let mut reader = std::io::BufReader::new(ca.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    Error::Error(format!("failed to parse CA certificate: {}", e))
                })?;
                root_store
                    .add(cert)
                    .map_err(|e| Error::Error(format!("failed to add CA certificate: {}", e)))?;
            }
        }
        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let domain_string = match &remote.addr.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        let port = remote.addr.port.map_or(5061, |p| p.value().to_owned());
        let socket_addr: SocketAddr = match &remote.addr.host {
            rsip::host_with_port::Host::Domain(domain) => {
                format!("{}:{}", domain, port).parse()?
            }
            rsip::host_with_port::Host::IpAddr(ip) => SocketAddr::new(*ip, port),
        };
        let server_name = pki_types::ServerName::try_from(domain_string.as_str())
            .map_err(|_| Error::Error(format!("invalid DNS name: {}", domain_string)))?
            .to_owned();

        let stream = TcpStream::connect(socket_addr).await?;
        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tls),
            addr: SipConnection::resolve_bind_address(stream.local_addr()?).into(),
        };
        let tls_stream = connector.connect(server_name, stream).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);

        info!("created TLS client connection: {} -> {}", local_addr, remote);
        Ok(TlsConnection {
            inner: TlsInner::Client(Arc::new(StreamInner::new(
                local_addr,
                remote.clone(),
                read_half,
                write_half,
            ))),
        })
    }

    fn from_server_stream(stream: TlsServerStream, local_addr: SipAddr) -> Result<Self> {
        let remote_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tls),
            addr: stream.get_ref().0.peer_addr()?.into(),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TlsConnection {
            inner: TlsInner::Server(Arc::new(StreamInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            ))),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        match &self.inner {
            TlsInner::Client(inner) => &inner.remote_addr,
            TlsInner::Server(inner) => &inner.remote_addr,
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        match &self.inner {
            TlsInner::Client(inner) => inner.send_message(msg).await,
            TlsInner::Server(inner) => inner.send_message(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let connection = SipConnection::Tls(self.clone());
        match &self.inner {
            TlsInner::Client(inner) => inner.serve_loop(sender, connection).await,
            TlsInner::Server(inner) => inner.serve_loop(sender, connection).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match &self.inner {
            TlsInner::Client(inner) => inner.close().await,
            TlsInner::Server(inner) => inner.close().await,
        }
    }
}

struct TlsListenerInner {
    local_addr: SipAddr,
    config: TlsConfig,
}

#[derive(Clone)]
pub struct TlsListenerConnection {
    inner: Arc<TlsListenerInner>,
}

impl TlsListenerConnection {
    pub fn new(local_addr: SipAddr, config: TlsConfig) -> Self {
        TlsListenerConnection {
            inner: Arc::new(TlsListenerInner { local_addr, config }),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let cert_pem = self
            .inner
            .config
            .cert
            .as_ref()
            .ok_or_else(|| Error::Error("TLS listener requires a certificate".to_string()))?;
        let key_pem = self
            .inner
            .config
            .key
            .as_ref()
            .ok_or_else(|| Error::Error("TLS listener requires a private key".to_string()))?;

        let mut reader = std::io::BufReader::new(cert_pem.as_slice());
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()
            .map_err(|e| Error::Error(format!("failed to parse certificate: {}", e)))?;

        let mut reader = std::io::BufReader::new(key_pem.as_slice());
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::Error(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::Error("no private key found in PEM".to_string()))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let acceptor = self.build_acceptor()?;
        let listener = TcpListener::bind(self.inner.local_addr.get_socketaddr()?).await?;
        let local_addr = self.inner.local_addr.clone();
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept TLS connection: {}", e);
                    continue;
                }
            };
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!(%remote_addr, "TLS handshake failed: {}", e);
                    continue;
                }
            };
            let connection = match TlsConnection::from_server_stream(tls_stream, local_addr.clone())
            {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to wrap TLS stream: {}", e);
                    continue;
                }
            };
            info!(%remote_addr, "new inbound TLS connection");
            let sip_connection = SipConnection::Tls(connection.clone());
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

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TlsListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl fmt::Debug for TlsListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
