use super::{SipAddr, SipConnection, TransportEvent, TransportSender, UDP_MAX_MESSAGE_SIZE};
#[cfg(feature = "rustls")]
use super::tls::{TlsConfig, TlsConnection};
use super::tcp::TcpConnection;
use crate::Result;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chooses the outbound transport for each message and owns every
/// connection the stack listens on or has opened.
///
/// Selection order on send (RFC 3261 18.1.1): a transport parameter on
/// the top Route wins, then the target URI's transport parameter, then
/// the URI scheme (`sips` forces TLS), and finally the message size:
/// UDP up to [`UDP_MAX_MESSAGE_SIZE`] bytes, TCP beyond that.
pub struct TransportSelector {
    pub inner: Arc<TransportSelectorInner>,
}

pub struct TransportSelectorInner {
    cancel_token: CancellationToken,
    connections: Mutex<HashMap<SipAddr, SipConnection>>,
    aliases: RwLock<HashSet<String>>,
    event_sender: Mutex<Option<TransportSender>>,
    #[cfg(feature = "rustls")]
    tls_config: Mutex<Option<TlsConfig>>,
}

pub type TransportSelectorRef = Arc<TransportSelectorInner>;

impl TransportSelector {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TransportSelectorInner {
                cancel_token,
                connections: Mutex::new(HashMap::new()),
                aliases: RwLock::new(HashSet::new()),
                event_sender: Mutex::new(None),
                #[cfg(feature = "rustls")]
                tls_config: Mutex::new(None),
            }),
        }
    }

    pub fn add_transport(&self, connection: SipConnection) {
        self.inner.add_connection(connection)
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner.del_connection(addr)
    }

    /// Register a domain this endpoint is responsible for.
    pub fn add_alias(&self, domain: &str) {
        self.inner
            .aliases
            .write()
            .unwrap()
            .insert(domain.to_ascii_lowercase());
    }

    pub fn is_my_domain(&self, domain: &str) -> bool {
        self.inner
            .aliases
            .read()
            .unwrap()
            .contains(&domain.to_ascii_lowercase())
    }

    #[cfg(feature = "rustls")]
    pub fn set_tls_config(&self, config: TlsConfig) {
        self.inner.tls_config.lock().unwrap().replace(config);
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    pub async fn select(
        &self,
        uri: &rsip::Uri,
        route: Option<&rsip::Uri>,
        msg_len: usize,
    ) -> Result<(SipConnection, SipAddr)> {
        self.inner.select(uri, route, msg_len).await
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .event_sender
            .lock()
            .unwrap()
            .replace(sender.clone());
        let connections = self.inner.connections.lock().unwrap().clone();
        for (_, connection) in connections {
            self.inner.spawn_serve_loop(connection, sender.clone());
        }
        Ok(())
    }
}

impl TransportSelectorInner {
    pub fn add_connection(&self, connection: SipConnection) {
        self.connections
            .lock()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection);
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.connections.lock().unwrap().remove(addr);
    }

    fn spawn_serve_loop(&self, connection: SipConnection, sender: TransportSender) {
        let sub_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            select! {
                _ = sub_token.cancelled() => {}
                _ = connection.serve_loop(sender.clone()) => {}
            }
            warn!("transport serve loop exited: {}", connection.get_addr());
            sender.send(TransportEvent::Closed(connection)).ok();
        });
    }

    fn decide_transport(
        uri: &rsip::Uri,
        route: Option<&rsip::Uri>,
        msg_len: usize,
    ) -> rsip::transport::Transport {
        if let Some(t) = route.and_then(|r| r.transport()) {
            return t.clone();
        }
        if let Some(t) = uri.transport() {
            return t.clone();
        }
        let next_hop = route.unwrap_or(uri);
        if next_hop.scheme == Some(rsip::Scheme::Sips) {
            return rsip::transport::Transport::Tls;
        }
        if msg_len > UDP_MAX_MESSAGE_SIZE {
            rsip::transport::Transport::Tcp
        } else {
            rsip::transport::Transport::Udp
        }
    }

    async fn select(
        &self,
        uri: &rsip::Uri,
        route: Option<&rsip::Uri>,
        msg_len: usize,
    ) -> Result<(SipConnection, SipAddr)> {
        let transport = Self::decide_transport(uri, route, msg_len);
        let next_hop = route.unwrap_or(uri);

        let mut addr = next_hop.host_with_port.clone();
        if addr.port.is_none() {
            let default_port = match transport {
                rsip::transport::Transport::Tls => 5061,
                _ => 5060,
            };
            addr.port = Some(default_port.into());
        }
        let target = SipAddr {
            r#type: Some(transport.clone()),
            addr,
        };
        debug!("selecting transport for {} -> {}", next_hop, target);

        if let Some(connection) = self.connections.lock().unwrap().get(&target) {
            return Ok((connection.clone(), target));
        }

        // a shared datagram socket serves every UDP destination
        if transport == rsip::transport::Transport::Udp {
            let connections = self.connections.lock().unwrap();
            for (_, connection) in connections.iter() {
                if connection.get_addr().r#type == Some(rsip::transport::Transport::Udp)
                    || matches!(connection, SipConnection::Channel(_))
                {
                    return Ok((connection.clone(), target));
                }
            }
            return Err(crate::Error::TransportLayerError(
                "no UDP transport configured".to_string(),
                target,
            ));
        }

        let connection = self.connect_stream(&target, transport).await?;
        self.add_connection(connection.clone());
        if let Some(sender) = self.event_sender.lock().unwrap().clone() {
            self.spawn_serve_loop(connection.clone(), sender);
        }
        Ok((connection, target))
    }

    async fn connect_stream(
        &self,
        target: &SipAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipConnection> {
        match transport {
            rsip::transport::Transport::Tcp => {
                let connection = TcpConnection::connect(target).await?;
                info!("opened outbound TCP connection to {}", target);
                Ok(connection.into())
            }
            #[cfg(feature = "rustls")]
            rsip::transport::Transport::Tls => {
                let config = self
                    .tls_config
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_default();
                let connection = TlsConnection::connect(target, &config).await?;
                info!("opened outbound TLS connection to {}", target);
                Ok(connection.into())
            }
            _ => Err(crate::Error::TransportLayerError(
                format!("unsupported transport: {}", transport),
                target.clone(),
            )),
        }
    }
}
