use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::{channel::ChannelConnection, SipAddr, TransportSelector};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_dialog;

pub(super) fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(20),
        timer_interval: Duration::from_millis(2),
    }
}

fn channel_addr(host: &str) -> SipAddr {
    SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: rsip::HostWithPort::try_from(host).expect("host"),
    }
}

pub(super) async fn create_test_endpoint(
    host: &str,
) -> crate::Result<(Arc<Endpoint>, ChannelConnection)> {
    let token = CancellationToken::new();
    let selector = TransportSelector::new(token.child_token());
    let (local, peer) =
        ChannelConnection::create_pair(channel_addr(host), channel_addr("peer.example.com:5060"));
    selector.add_transport(local.into());
    let endpoint = Arc::new(
        EndpointBuilder::new()
            .user_agent("convostack-test")
            .transport_selector(selector)
            .cancel_token(token)
            .option(fast_option())
            .build(),
    );
    endpoint.inner.start_transports().await?;
    let serve = endpoint.clone();
    tokio::spawn(async move { serve.serve().await });
    Ok((endpoint, peer))
}

pub(super) fn create_invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> rsip::Request {
    use rsip::headers::*;
    let to_value = if to_tag.is_empty() {
        "Bob <sip:bob@example.com>".to_string()
    } else {
        format!("Bob <sip:bob@example.com>;tag={}", to_tag)
    };
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds").into(),
            CSeq::new("1 INVITE").into(),
            From::new(format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new(to_value).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@alice.example.com:5060>").into(),
            RecordRoute::new("<sip:proxy1.example.com;lr>").into(),
            RecordRoute::new("<sip:proxy2.example.com;lr>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: b"v=0\r\no=alice 1 1 IN IP4 alice.example.com\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n".to_vec(),
    }
}
