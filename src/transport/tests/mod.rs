use super::{channel::ChannelConnection, SipAddr};

mod test_channel;
mod test_selector;

pub(super) fn channel_addr(host: &str) -> SipAddr {
    SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: rsip::HostWithPort::try_from(host).expect("host"),
    }
}

pub(super) fn channel_pair(a: &str, b: &str) -> (ChannelConnection, ChannelConnection) {
    ChannelConnection::create_pair(channel_addr(a), channel_addr(b))
}

pub(super) fn sample_register() -> rsip::Request {
    use rsip::headers::*;
    rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:registrar.example.com").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP client.example.com:5060;branch=z9hG4bK74bf9").into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Alice <sip:alice@example.com>;tag=88sja8x").into(),
            To::new("Alice <sip:alice@example.com>").into(),
            CallId::new("74bf9@client.example.com").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}
