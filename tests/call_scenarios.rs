//! End-to-end call flows: two stacks back to back over an in-memory
//! channel, or one stack against a scripted peer that plays the network.

use convostack::conversation::{
    events::ConversationEvent, manager::ConversationProfile, AutoHoldMode,
    ConversationManagerHandle, ForkSelectMode,
};
use convostack::endpoint::{Stack, StackBuilder};
use convostack::transaction::endpoint::EndpointOption;
use convostack::transport::{
    channel::ChannelConnection, SipAddr, TransportEvent, TransportReceiver,
};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, SipMessage, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

const UA_SDP: &[u8] = b"v=0\r\n\
o=convostack 1 1 IN IP4 192.0.2.10\r\n\
s=-\r\n\
c=IN IP4 192.0.2.10\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

const PEER_SDP: &[u8] = b"v=0\r\n\
o=peer 1 1 IN IP4 192.0.2.20\r\n\
s=-\r\n\
c=IN IP4 192.0.2.20\r\n\
t=0 0\r\n\
m=audio 4002 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

fn fast_option() -> EndpointOption {
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

struct Ua {
    _stack: Arc<Stack>,
    manager: ConversationManagerHandle,
    events: UnboundedReceiver<ConversationEvent>,
}

fn make_ua(name: &str, connection: ChannelConnection) -> Ua {
    let stack = Arc::new(
        StackBuilder::new()
            .user_agent("convostack-test")
            .option(fast_option())
            .transport(connection.into())
            .alias(&format!("{}.example.com", name))
            .build(),
    );
    let (app_sender, events) = unbounded_channel();
    let profile = ConversationProfile {
        aor: format!("sip:{}@{}.example.com", name, name)
            .as_str()
            .try_into()
            .expect("aor"),
        contact: format!("sip:{}@{}.example.com:5060", name, name)
            .as_str()
            .try_into()
            .expect("contact"),
        session_description: UA_SDP.to_vec(),
        credential: None,
    };
    let (manager, engine) = stack.conversation_manager(profile, app_sender);
    let serve = stack.clone();
    tokio::spawn(async move { serve.serve().await });
    tokio::spawn(engine.run());
    Ua {
        _stack: stack,
        manager,
        events,
    }
}

/// Two user agents wired back to back.
fn linked_uas() -> (Ua, Ua) {
    let (conn_a, conn_b) = ChannelConnection::create_pair(
        channel_addr("alice.example.com:5060"),
        channel_addr("bob.example.com:5060"),
    );
    (make_ua("alice", conn_a), make_ua("bob", conn_b))
}

/// One user agent against a hand-driven network peer.
fn scripted_ua(name: &str) -> (Ua, ChannelConnection, TransportReceiver) {
    let (conn_ua, conn_net) = ChannelConnection::create_pair(
        channel_addr(&format!("{}.example.com:5060", name)),
        channel_addr("net.example.com:5060"),
    );
    let ua = make_ua(name, conn_ua);
    let (net_sender, net_events) = unbounded_channel();
    let serve_net = conn_net.clone();
    tokio::spawn(async move { serve_net.serve_loop(net_sender).await });
    (ua, conn_net, net_events)
}

async fn expect_event<F>(ua: &mut Ua, what: &str, matches: F) -> ConversationEvent
where
    F: Fn(&ConversationEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
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

async fn expect_request(net: &mut TransportReceiver, method: Method) -> rsip::Request {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    loop {
        let event = tokio::time::timeout_at(deadline, net.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", method))
            .unwrap_or_else(|| panic!("network channel closed waiting for {}", method));
        if let TransportEvent::Incoming(SipMessage::Request(req), _, _) = event {
            if req.method == method {
                return req;
            }
        }
    }
}

/// Scripted response: identity mirrored from the request, optional To
/// tag, SDP body, and Contact.
fn script_response(
    req: &rsip::Request,
    status: StatusCode,
    to_tag: Option<&str>,
    sdp: Option<&[u8]>,
    contact: Option<&str>,
) -> rsip::Response {
    let mut headers = rsip::Headers::default();
    headers.push(Header::Via(req.via_header().expect("via").clone()));
    headers.push(Header::From(req.from_header().expect("from").clone()));
    let to = req.to_header().expect("to").typed().expect("typed to");
    let to = match to_tag {
        Some(tag) if !to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) => {
            to.with_tag(tag.into())
        }
        _ => to,
    };
    headers.push(Header::To(to.into()));
    headers.push(Header::CallId(req.call_id_header().expect("call-id").clone()));
    headers.push(Header::CSeq(req.cseq_header().expect("cseq").clone()));
    if let Some(contact) = contact {
        headers.push(Header::Contact(contact.to_string().into()));
    }
    let body = sdp.map(|s| s.to_vec()).unwrap_or_default();
    if !body.is_empty() {
        headers.push(Header::ContentType("application/sdp".into()));
    }
    headers.push(Header::ContentLength((body.len() as u32).into()));
    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers,
        body,
    }
}

fn to_tag_of(req: &rsip::Request) -> String {
    req.to_header()
        .ok()
        .and_then(|to| to.tag().ok().flatten())
        .map(|t| t.value().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------
// S1: basic call between two stacks
// ---------------------------------------------------------------------

#[tokio::test]
async fn s1_basic_call() {
    let (mut alice, mut bob) = linked_uas();

    let conv = alice.manager.create_conversation(AutoHoldMode::Disabled);
    let remote = alice.manager.create_remote_participant(
        conv,
        "sip:bob@bob.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    let incoming = expect_event(&mut bob, "IncomingParticipant", |e| {
        matches!(e, ConversationEvent::IncomingParticipant { .. })
    })
    .await;
    let bob_part = match incoming {
        ConversationEvent::IncomingParticipant { participant, from } => {
            assert!(from.contains("alice"));
            participant
        }
        _ => unreachable!(),
    };

    bob.manager.alert_participant(bob_part, false);
    expect_event(&mut alice, "ParticipantAlerting", |e| {
        matches!(e, ConversationEvent::ParticipantAlerting { participant, .. } if *participant == remote)
    })
    .await;

    let bob_conv = bob.manager.create_conversation(AutoHoldMode::Disabled);
    bob.manager.add_participant(bob_conv, bob_part);
    bob.manager.answer_participant(bob_part);

    expect_event(&mut alice, "ParticipantConnected", |e| {
        matches!(e, ConversationEvent::ParticipantConnected { participant } if *participant == remote)
    })
    .await;
    expect_event(&mut bob, "ParticipantConnectedConfirmed", |e| {
        matches!(e, ConversationEvent::ParticipantConnectedConfirmed { participant } if *participant == bob_part)
    })
    .await;

    alice.manager.destroy_participant(remote);
    let terminated = expect_event(&mut bob, "ParticipantTerminated", |e| {
        matches!(e, ConversationEvent::ParticipantTerminated { participant, .. } if *participant == bob_part)
    })
    .await;
    match terminated {
        ConversationEvent::ParticipantTerminated { status_code, .. } => {
            assert_eq!(status_code, 200, "a normal BYE ends the call cleanly");
        }
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------
// S2: forking proxy, automatic selection
// ---------------------------------------------------------------------

#[tokio::test]
async fn s2_fork_automatic_keeps_one_leg() {
    let (mut ua, net_conn, mut net) = scripted_ua("alice");

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let original = ua.manager.create_remote_participant(
        conv,
        "sip:bob@net.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    let invite = expect_request(&mut net, Method::Invite).await;

    // first fork rings
    net_conn
        .send(script_response(&invite, StatusCode::Ringing, Some("fork1"), None, Some("<sip:bob1@net.example.com:5060>")).into())
        .await
        .expect("send 180 fork1");
    expect_event(&mut ua, "ParticipantAlerting", |e| {
        matches!(e, ConversationEvent::ParticipantAlerting { participant, .. } if *participant == original)
    })
    .await;

    // second fork rings: a related conversation appears, exactly once
    net_conn
        .send(script_response(&invite, StatusCode::Ringing, Some("fork2"), None, Some("<sip:bob2@net.example.com:5060>")).into())
        .await
        .expect("send 180 fork2");
    expect_event(&mut ua, "RelatedConversation", |e| {
        matches!(e, ConversationEvent::RelatedConversation { original_participant, .. } if *original_participant == original)
    })
    .await;

    // fork1 answers and wins
    net_conn
        .send(script_response(&invite, StatusCode::OK, Some("fork1"), Some(PEER_SDP), Some("<sip:bob1@net.example.com:5060>")).into())
        .await
        .expect("send 200 fork1");
    expect_event(&mut ua, "ParticipantConnected", |e| {
        matches!(e, ConversationEvent::ParticipantConnected { participant } if *participant == original)
    })
    .await;
    let ack = expect_request(&mut net, Method::Ack).await;
    assert_eq!(to_tag_of(&ack), "fork1");

    // fork2 answers late: the stack confirms the dialog and releases it
    net_conn
        .send(script_response(&invite, StatusCode::OK, Some("fork2"), Some(PEER_SDP), Some("<sip:bob2@net.example.com:5060>")).into())
        .await
        .expect("send late 200 fork2");
    let late_ack = expect_request(&mut net, Method::Ack).await;
    assert_eq!(to_tag_of(&late_ack), "fork2");
    let bye = expect_request(&mut net, Method::Bye).await;
    assert_eq!(to_tag_of(&bye), "fork2", "only the losing fork is released");
    net_conn
        .send(script_response(&bye, StatusCode::OK, None, None, None).into())
        .await
        .expect("answer BYE");
}

// ---------------------------------------------------------------------
// S3: auto-hold on sole membership
// ---------------------------------------------------------------------

#[tokio::test]
async fn s3_auto_hold_follows_membership() {
    let (mut alice, mut bob) = linked_uas();

    let conv = alice.manager.create_conversation(AutoHoldMode::Enabled);
    let remote = alice.manager.create_remote_participant(
        conv,
        "sip:bob@bob.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    let incoming = expect_event(&mut bob, "IncomingParticipant", |e| {
        matches!(e, ConversationEvent::IncomingParticipant { .. })
    })
    .await;
    let bob_part = match incoming {
        ConversationEvent::IncomingParticipant { participant, .. } => participant,
        _ => unreachable!(),
    };

    // the remote participant is alone in its conversation, so the
    // INVITE already carries hold media
    expect_event(&mut bob, "RequestedHold(true)", |e| {
        matches!(e, ConversationEvent::ParticipantRequestedHold { held: true, .. })
    })
    .await;

    let bob_conv = bob.manager.create_conversation(AutoHoldMode::Disabled);
    bob.manager.add_participant(bob_conv, bob_part);
    bob.manager.answer_participant(bob_part);
    expect_event(&mut alice, "ParticipantConnected", |e| {
        matches!(e, ConversationEvent::ParticipantConnected { participant } if *participant == remote)
    })
    .await;

    // company arrives: the stack un-holds with a re-INVITE
    let _tone = alice.manager.create_media_participant(conv, "tone:holding");
    expect_event(&mut bob, "RequestedHold(false)", |e| {
        matches!(e, ConversationEvent::ParticipantRequestedHold { held: false, .. })
    })
    .await;

    // alone again: held again
    alice.manager.destroy_participant(_tone);
    expect_event(&mut bob, "RequestedHold(true) after re-hold", |e| {
        matches!(e, ConversationEvent::ParticipantRequestedHold { held: true, .. })
    })
    .await;
}

// ---------------------------------------------------------------------
// S4: offer glare on re-INVITE
// ---------------------------------------------------------------------

#[tokio::test]
async fn s4_reinvite_glare_backs_off_and_retries() {
    let (mut ua, net_conn, mut net) = scripted_ua("alice");

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let remote = ua.manager.create_remote_participant(
        conv,
        "sip:bob@net.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    let invite = expect_request(&mut net, Method::Invite).await;
    net_conn
        .send(script_response(&invite, StatusCode::OK, Some("peer"), Some(PEER_SDP), Some("<sip:bob@net.example.com:5060>")).into())
        .await
        .expect("answer INVITE");
    expect_event(&mut ua, "ParticipantConnected", |e| {
        matches!(e, ConversationEvent::ParticipantConnected { participant } if *participant == remote)
    })
    .await;
    expect_request(&mut net, Method::Ack).await;

    // hold triggers a re-INVITE; the peer answers 491 as if its own
    // offer crossed ours on the wire
    ua.manager.hold_participant(remote, true);
    let first = expect_request(&mut net, Method::Invite).await;
    let first_cseq = first.cseq_header().expect("cseq").seq().expect("seq");
    net_conn
        .send(script_response(&first, StatusCode::RequestPending, None, None, None).into())
        .await
        .expect("send 491");

    // the retry arrives within the 0..2s backoff window, with a fresh
    // CSeq, and this time succeeds
    let retry = expect_request(&mut net, Method::Invite).await;
    let retry_cseq = retry.cseq_header().expect("cseq").seq().expect("seq");
    assert!(retry_cseq > first_cseq);
    assert!(String::from_utf8_lossy(&retry.body).contains("a=sendonly"));
    net_conn
        .send(script_response(&retry, StatusCode::OK, None, Some(PEER_SDP), None).into())
        .await
        .expect("answer retry");
    expect_request(&mut net, Method::Ack).await;

    // exactly one successful exchange: the session is still usable
    ua.manager.hold_participant(remote, false);
    let resume = expect_request(&mut net, Method::Invite).await;
    assert!(String::from_utf8_lossy(&resume.body).contains("a=sendrecv"));
    net_conn
        .send(script_response(&resume, StatusCode::OK, None, Some(PEER_SDP), None).into())
        .await
        .expect("answer resume");
    expect_request(&mut net, Method::Ack).await;
}

// ---------------------------------------------------------------------
// S5: CANCEL races the answer
// ---------------------------------------------------------------------

#[tokio::test]
async fn s5_cancel_race_confirms_then_releases() {
    let (mut ua, net_conn, mut net) = scripted_ua("alice");

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let remote = ua.manager.create_remote_participant(
        conv,
        "sip:bob@net.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    let invite = expect_request(&mut net, Method::Invite).await;
    net_conn
        .send(script_response(&invite, StatusCode::Ringing, Some("racer"), None, Some("<sip:bob@net.example.com:5060>")).into())
        .await
        .expect("send 180");
    expect_event(&mut ua, "ParticipantAlerting", |e| {
        matches!(e, ConversationEvent::ParticipantAlerting { .. })
    })
    .await;

    // the application gives up before any final response
    ua.manager.destroy_participant(remote);
    let cancel = expect_request(&mut net, Method::Cancel).await;
    assert_eq!(
        cancel.cseq_header().expect("cseq").seq().expect("seq"),
        invite.cseq_header().expect("cseq").seq().expect("seq"),
        "CANCEL reuses the INVITE CSeq number"
    );
    net_conn
        .send(script_response(&cancel, StatusCode::OK, None, None, None).into())
        .await
        .expect("answer CANCEL");

    // but the 200 was already in flight: confirmed, then torn down
    net_conn
        .send(script_response(&invite, StatusCode::OK, Some("racer"), Some(PEER_SDP), Some("<sip:bob@net.example.com:5060>")).into())
        .await
        .expect("send racing 200");
    expect_request(&mut net, Method::Ack).await;
    let bye = expect_request(&mut net, Method::Bye).await;
    assert_eq!(to_tag_of(&bye), "racer");
    net_conn
        .send(script_response(&bye, StatusCode::OK, None, None, None).into())
        .await
        .expect("answer BYE");

    expect_event(&mut ua, "ParticipantTerminated", |e| {
        matches!(
            e,
            ConversationEvent::ParticipantTerminated {
                status_code: 487,
                ..
            }
        )
    })
    .await;
}

// ---------------------------------------------------------------------
// S6: transaction timeout over a dead transport
// ---------------------------------------------------------------------

#[tokio::test]
async fn s6_invite_timeout_reports_network_error() {
    // the peer end of the channel is never served: every message
    // disappears, exactly like an unreachable host
    let (conn_ua, _dead_peer) = ChannelConnection::create_pair(
        channel_addr("alice.example.com:5060"),
        channel_addr("blackhole.example.com:5060"),
    );
    let mut ua = make_ua("alice", conn_ua);

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let remote = ua.manager.create_remote_participant(
        conv,
        "sip:nobody@blackhole.example.com:5060".try_into().expect("uri"),
        ForkSelectMode::Automatic,
    );

    // timer B fires at 64*T1 (640ms with test timings) and surfaces as
    // a synthetic 408
    let event = expect_event(&mut ua, "ParticipantTerminated", |e| {
        matches!(e, ConversationEvent::ParticipantTerminated { participant, .. } if *participant == remote)
    })
    .await;
    match event {
        ConversationEvent::ParticipantTerminated { status_code, .. } => {
            assert_eq!(status_code, 408);
        }
        _ => unreachable!(),
    }
}
