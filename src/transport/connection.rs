use super::{
    channel::ChannelConnection, sip_addr::SipAddr, tcp::TcpConnection,
    tcp_listener::TcpListenerConnection, udp::UdpConnection, TransportSender,
};
#[cfg(feature = "rustls")]
use super::tls::{TlsConnection, TlsListenerConnection};
use crate::Result;
use get_if_addrs::IfAddr;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Param, SipMessage,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::fmt;
use tracing::debug;

/// One transport a SIP message can travel over.
///
/// The enum gives the rest of the stack a uniform send/serve surface over
/// datagram, stream, and in-memory connections. Listener variants only
/// accept; they never carry messages themselves.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Channel(ChannelConnection),
    Udp(UdpConnection),
    Tcp(TcpConnection),
    TcpListener(TcpListenerConnection),
    #[cfg(feature = "rustls")]
    Tls(TlsConnection),
    #[cfg(feature = "rustls")]
    TlsListener(TlsListenerConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipConnection::Udp(_))
    }

    pub fn is_stream(&self) -> bool {
        match self {
            SipConnection::Tcp(_) => true,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(_) => true,
            _ => false,
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Channel(t) => t.get_addr(),
            SipConnection::Udp(t) => t.get_addr(),
            SipConnection::Tcp(t) => t.get_addr(),
            SipConnection::TcpListener(t) => t.get_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(t) => t.get_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(t) => t.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Channel(t) => t.send(msg).await,
            SipConnection::Udp(t) => t.send(msg, destination).await,
            SipConnection::Tcp(t) => t.send_message(msg).await,
            SipConnection::TcpListener(t) => Err(crate::Error::TransportLayerError(
                "listener cannot send".to_string(),
                t.get_addr().clone(),
            )),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(t) => t.send_message(msg).await,
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(t) => Err(crate::Error::TransportLayerError(
                "listener cannot send".to_string(),
                t.get_addr().clone(),
            )),
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Channel(t) => t.serve_loop(sender).await,
            SipConnection::Udp(t) => t.serve_loop(sender).await,
            SipConnection::Tcp(t) => t.serve_loop(sender).await,
            SipConnection::TcpListener(t) => t.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(t) => t.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(t) => t.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Channel(t) => t.close().await,
            SipConnection::Udp(_) => Ok(()),
            SipConnection::Tcp(t) => t.close().await,
            SipConnection::TcpListener(t) => t.close().await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(t) => t.close().await,
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(t) => t.close().await,
        }
    }
}

impl SipConnection {
    /// Stamp `received`/`rport` on the top Via of an inbound request when
    /// the source address differs from what the sender wrote (RFC 3261
    /// 18.2.1). Responses pass through untouched.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr, transport)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(
        via: &mut rsip::headers::Via,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<()> {
        let received: rsip::HostWithPort = addr.into();
        let mut typed_via = via.typed()?;

        typed_via.params.retain(|param| {
            if let Param::Other(key, _) = param {
                !key.value().eq_ignore_ascii_case("rport")
            } else {
                !matches!(param, Param::Received(_))
            }
        });

        if typed_via.uri.host_with_port == received {
            return Ok(());
        }

        // Stream transports only need the annotation when the host itself
        // differs; the source port of an outbound TCP connection is
        // ephemeral and not useful for routing.
        let should_add_received = match transport {
            rsip::transport::Transport::Udp => true,
            _ => typed_via.uri.host_with_port.host != received.host,
        };
        if !should_add_received {
            return Ok(());
        }

        *via = typed_via
            .with_param(Param::Received(rsip::param::Received::new(
                received.host.to_string(),
            )))
            .with_param(Param::Other(
                rsip::param::OtherParam::new("rport"),
                Some(rsip::param::OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Where a response to a request carrying this Via should be sent,
    /// honouring `received` and `rport`.
    pub fn parse_target_from_via(
        via: &rsip::headers::untyped::Via,
    ) -> Result<(rsip::Transport, rsip::HostWithPort)> {
        let mut host_with_port = via.uri()?.host_with_port;
        let mut transport = via.trasnport().unwrap_or(rsip::Transport::Udp);
        if let Ok(params) = via.params().as_ref() {
            for param in params {
                match param {
                    Param::Received(v) => {
                        if let Ok(addr) = v.parse() {
                            host_with_port.host = addr.into();
                        }
                    }
                    Param::Transport(t) => {
                        transport = t.clone();
                    }
                    Param::Other(key, Some(value))
                        if key.value().eq_ignore_ascii_case("rport") =>
                    {
                        if let Ok(port) = value.value().try_into() {
                            host_with_port.port = Some(port);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok((transport, host_with_port))
    }

    pub fn get_destination(msg: &SipMessage) -> Result<SocketAddr> {
        let host_with_port = match msg {
            SipMessage::Request(req) => req.uri().host_with_port.clone(),
            SipMessage::Response(res) => Self::parse_target_from_via(res.via_header()?)?.1,
        };
        host_with_port.try_into().map_err(Into::into)
    }

    /// Replace an unspecified bind address (0.0.0.0) with the first
    /// non-loopback interface so Via/Contact headers carry a routable
    /// host.
    pub fn resolve_bind_address(addr: SocketAddr) -> SocketAddr {
        if !addr.ip().is_unspecified() {
            return addr;
        }
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(_) => return addr,
        };
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4addr) = interface.addr {
                return SocketAddr::new(IpAddr::V4(v4addr.ip), addr.port());
            }
        }
        debug!("no non-loopback interface found, falling back to 127.0.0.1");
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Channel(t) => write!(f, "{}", t),
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::TcpListener(t) => write!(f, "TCP LISTEN {}", t),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(t) => write!(f, "TLS {}", t),
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(t) => write!(f, "TLS LISTEN {}", t),
        }
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TcpListenerConnection> for SipConnection {
    fn from(connection: TcpListenerConnection) -> Self {
        SipConnection::TcpListener(connection)
    }
}

#[cfg(feature = "rustls")]
impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}

#[cfg(feature = "rustls")]
impl From<TlsListenerConnection> for SipConnection {
    fn from(connection: TlsListenerConnection) -> Self {
        SipConnection::TlsListener(connection)
    }
}
