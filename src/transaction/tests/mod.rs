use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::{channel::ChannelConnection, SipAddr, TransportSelector};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_server;

/// Compressed timings so timeout paths run in tens of milliseconds.
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

/// An endpoint wired to an in-memory channel. The returned peer end is
/// the "network": read what the endpoint sends, inject what it should
/// receive.
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

pub(super) fn make_test_request(method: rsip::Method, branch: &str) -> rsip::Request {
    use rsip::headers::*;
    rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:bob@target.example.com:5060").unwrap(),
        headers: vec![
            Via::new(format!(
                "SIP/2.0/UDP ua.example.com:5060;branch={}",
                branch
            ))
            .into(),
            CSeq::new(format!("1 {}", method)).into(),
            From::new("Alice <sip:alice@example.com>;tag=1928301774").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("a84b4c76e66710@ua.example.com").into(),
            Contact::new("<sip:alice@ua.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

pub(super) fn make_test_response(
    req: &rsip::Request,
    status: rsip::StatusCode,
    to_tag: Option<&str>,
) -> rsip::Response {
    use rsip::prelude::{HeadersExt, ToTypedHeader};
    let mut resp = crate::transaction::message::make_response(req, status, None);
    if let Some(tag) = to_tag {
        if let Ok(to) = resp.to_header() {
            if let Ok(typed) = to.typed() {
                let tagged = typed.with_tag(tag.into());
                resp.headers.retain(|h| !matches!(h, rsip::Header::To(_)));
                resp.headers.push(rsip::Header::To(tagged.into()));
            }
        }
    }
    resp
}

#[test]
fn test_random_helpers() {
    use crate::transaction::{make_call_id, make_tag, make_via_branch, random_text};
    assert_eq!(random_text(10).len(), 10);
    assert!(make_via_branch().to_string().contains("z9hG4bK"));
    assert_eq!(make_tag().to_string().len(), 8);
    assert!(make_call_id(Some("example.com"))
        .to_string()
        .ends_with("@example.com"));
}
