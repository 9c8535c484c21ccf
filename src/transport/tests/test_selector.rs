use super::channel_pair;
use crate::transport::{udp::UdpConnection, TransportSelector};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_select_prefers_registered_udp() -> crate::Result<()> {
    let selector = TransportSelector::new(CancellationToken::new());

    let uri: rsip::Uri = "sip:bob@127.0.0.1:5060".try_into().expect("uri");
    assert!(selector.select(&uri, None, 300).await.is_err());

    let udp = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let udp_addr = udp.get_addr().clone();
    selector.add_transport(udp.into());

    let (connection, target) = selector.select(&uri, None, 300).await?;
    assert_eq!(connection.get_addr(), &udp_addr);
    assert_eq!(target.r#type, Some(rsip::transport::Transport::Udp));
    Ok(())
}

#[tokio::test]
async fn test_route_transport_parameter_wins() -> crate::Result<()> {
    let selector = TransportSelector::new(CancellationToken::new());
    let (conn, _peer) = channel_pair("a.example.com:5060", "b.example.com:5060");
    selector.add_transport(conn.into());

    // the Route demands TCP; with no TCP listener and nothing to
    // connect to, selection must not silently fall back to UDP
    let uri: rsip::Uri = "sip:bob@b.example.com".try_into().expect("uri");
    let route: rsip::Uri = "sip:proxy.invalid:1;transport=tcp".try_into().expect("route");
    assert!(selector.select(&uri, Some(&route), 300).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_large_message_prefers_stream() -> crate::Result<()> {
    let selector = TransportSelector::new(CancellationToken::new());
    let (conn, _peer) = channel_pair("a.example.com:5060", "b.example.com:5060");
    selector.add_transport(conn.into());

    let uri: rsip::Uri = "sip:bob@127.0.0.1:1".try_into().expect("uri");
    // over the UDP ceiling the selector goes for TCP, which has nothing
    // listening on 127.0.0.1:1
    assert!(selector.select(&uri, None, 2000).await.is_err());
    // under the ceiling the shared channel transport carries it
    assert!(selector.select(&uri, None, 200).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_domain_aliases() {
    let selector = TransportSelector::new(CancellationToken::new());
    selector.add_alias("example.com");
    selector.add_alias("Voice.Example.COM");

    assert!(selector.is_my_domain("example.com"));
    assert!(selector.is_my_domain("EXAMPLE.com"));
    assert!(selector.is_my_domain("voice.example.com"));
    assert!(!selector.is_my_domain("elsewhere.org"));
}
