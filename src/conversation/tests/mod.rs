use crate::conversation::{
    events::ConversationEvent, manager::ConversationProfile, ConversationManagerHandle,
};
use crate::endpoint::{Stack, StackBuilder};
use crate::transaction::endpoint::EndpointOption;
use crate::transport::{channel::ChannelConnection, SipAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

mod test_manager;

pub(super) const LOCAL_SDP: &[u8] = b"v=0\r\n\
o=convostack 1 1 IN IP4 192.0.2.10\r\n\
s=-\r\n\
c=IN IP4 192.0.2.10\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

pub(super) struct TestUa {
    pub stack: Arc<Stack>,
    pub manager: ConversationManagerHandle,
    pub events: UnboundedReceiver<ConversationEvent>,
}

fn channel_addr(host: &str) -> SipAddr {
    SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: rsip::HostWithPort::try_from(host).expect("host"),
    }
}

fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(20),
        timer_interval: Duration::from_millis(2),
    }
}

/// A full stack whose transport is one end of an in-memory channel; the
/// other end is returned for the test to play the network.
pub(super) async fn test_ua(name: &str) -> (TestUa, ChannelConnection) {
    let host = format!("{}.example.com:5060", name);
    let (local, peer) =
        ChannelConnection::create_pair(channel_addr(&host), channel_addr("net.example.com:5060"));

    let stack = Arc::new(
        StackBuilder::new()
            .user_agent("convostack-test")
            .option(fast_option())
            .transport(local.into())
            .alias(&format!("{}.example.com", name))
            .build(),
    );
    let (app_sender, app_events) = unbounded_channel();
    let profile = ConversationProfile {
        aor: format!("sip:{}@{}.example.com", name, name)
            .as_str()
            .try_into()
            .expect("aor"),
        contact: format!("sip:{}@{}", name, host)
            .as_str()
            .try_into()
            .expect("contact"),
        session_description: LOCAL_SDP.to_vec(),
        credential: None,
    };
    let (manager_handle, manager) = stack.conversation_manager(profile, app_sender);

    let serve = stack.clone();
    tokio::spawn(async move { serve.serve().await });
    tokio::spawn(manager.run());

    (
        TestUa {
            stack,
            manager: manager_handle,
            events: app_events,
        },
        peer,
    )
}

pub(super) async fn expect_event<F>(ua: &mut TestUa, what: &str, matches: F) -> ConversationEvent
where
    F: Fn(&ConversationEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, ua.events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap_or_else(|| panic!("event channel closed waiting for {}", what));
        if matches(&event) {
            return event;
        }
    }
}
