//! Server transaction behavior and endpoint demultiplexing.

use super::{create_test_endpoint, make_test_request};
use crate::transaction::{EndpointEvent, TransactionState, TransactionType};
use rsip::{Method, SipMessage, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

async fn recv_message(
    receiver: &mut crate::transport::TransportReceiver,
) -> SipMessage {
    let event = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("message expected")
        .expect("channel open");
    match event {
        crate::transport::TransportEvent::Incoming(msg, _, _) => msg,
        other => panic!("unexpected transport event: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_invite_accept_flow() -> crate::Result<()> {
    let (endpoint, peer) = create_test_endpoint("uas.example.com:5060").await?;
    let mut events = endpoint.take_events().expect("endpoint events");

    let (peer_sender, mut from_uas) = unbounded_channel();
    let serve_peer = peer.clone();
    tokio::spawn(async move { serve_peer.serve_loop(peer_sender).await });

    peer.send(make_test_request(Method::Invite, "z9hG4bKsrv1").into())
        .await?;

    let mut tx = match events.recv().await.expect("incoming transaction") {
        EndpointEvent::Request(tx) => tx,
        _ => panic!("expected new server transaction"),
    };
    assert_eq!(tx.transaction_type, TransactionType::ServerInvite);
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.reply(StatusCode::Ringing).await?;
    match recv_message(&mut from_uas).await {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::Ringing),
        _ => panic!("expected 180"),
    }

    tx.reply(StatusCode::OK).await?;
    match recv_message(&mut from_uas).await {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::OK),
        _ => panic!("expected 200"),
    }
    // a 2xx terminates the INVITE server transaction immediately
    assert_eq!(tx.state, TransactionState::Terminated);
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_answered_and_forwarded() -> crate::Result<()> {
    let (endpoint, peer) = create_test_endpoint("uas.example.com:5060").await?;
    let mut events = endpoint.take_events().expect("endpoint events");

    let (peer_sender, mut from_uas) = unbounded_channel();
    let serve_peer = peer.clone();
    tokio::spawn(async move { serve_peer.serve_loop(peer_sender).await });

    peer.send(make_test_request(Method::Invite, "z9hG4bKsrv2").into())
        .await?;
    let mut tx = match events.recv().await.expect("incoming transaction") {
        EndpointEvent::Request(tx) => tx,
        _ => panic!("expected new server transaction"),
    };

    peer.send(make_test_request(Method::Cancel, "z9hG4bKsrv2").into())
        .await?;

    // the INVITE transaction sees the CANCEL and answers it 487
    let msg = tokio::time::timeout(Duration::from_secs(2), tx.receive())
        .await
        .expect("cancel expected")
        .expect("transaction alive");
    match msg {
        SipMessage::Request(req) => assert_eq!(req.method, Method::Cancel),
        _ => panic!("expected CANCEL request"),
    }

    // the peer observes both the 200 for the CANCEL and the 487 for the
    // INVITE, in either order
    let mut saw_cancel_ok = false;
    let mut saw_487 = false;
    for _ in 0..2 {
        if let SipMessage::Response(resp) = recv_message(&mut from_uas).await {
            match resp.status_code {
                StatusCode::OK => saw_cancel_ok = true,
                StatusCode::RequestTerminated => saw_487 = true,
                other => panic!("unexpected status {}", other),
            }
        }
    }
    assert!(saw_cancel_ok && saw_487);
    Ok(())
}

#[tokio::test]
async fn test_cancel_without_invite_gets_481() -> crate::Result<()> {
    let (_endpoint, peer) = create_test_endpoint("uas.example.com:5060").await?;

    let (peer_sender, mut from_uas) = unbounded_channel();
    let serve_peer = peer.clone();
    tokio::spawn(async move { serve_peer.serve_loop(peer_sender).await });

    peer.send(make_test_request(Method::Cancel, "z9hG4bKsrv3").into())
        .await?;
    match recv_message(&mut from_uas).await {
        SipMessage::Response(resp) => {
            assert_eq!(resp.status_code, StatusCode::CallTransactionDoesNotExist)
        }
        _ => panic!("expected 481"),
    }
    Ok(())
}

#[tokio::test]
async fn test_ack_for_2xx_bypasses_transactions() -> crate::Result<()> {
    let (endpoint, peer) = create_test_endpoint("uas.example.com:5060").await?;
    let mut events = endpoint.take_events().expect("endpoint events");

    // an ACK with no matching INVITE transaction goes straight up as a
    // dialog-level event
    peer.send(make_test_request(Method::Ack, "z9hG4bKsrv4").into())
        .await?;
    match tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event expected")
        .expect("events open")
    {
        EndpointEvent::Ack(req, _) => assert_eq!(req.method, Method::Ack),
        _ => panic!("expected ACK event"),
    }
    Ok(())
}

#[tokio::test]
async fn test_request_retransmission_replays_response() -> crate::Result<()> {
    let (endpoint, peer) = create_test_endpoint("uas.example.com:5060").await?;
    let mut events = endpoint.take_events().expect("endpoint events");

    let (peer_sender, mut from_uas) = unbounded_channel();
    let serve_peer = peer.clone();
    tokio::spawn(async move { serve_peer.serve_loop(peer_sender).await });

    let register = make_test_request(Method::Register, "z9hG4bKsrv5");
    peer.send(register.clone().into()).await?;
    let mut tx = match events.recv().await.expect("incoming transaction") {
        EndpointEvent::Request(tx) => tx,
        _ => panic!("expected new server transaction"),
    };
    assert_eq!(tx.transaction_type, TransactionType::ServerNonInvite);
    tx.reply(StatusCode::OK).await?;
    match recv_message(&mut from_uas).await {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::OK),
        _ => panic!("expected 200"),
    }

    // retransmission of the request is absorbed and answered again from
    // the cached final response, without a new transaction event
    let spin = tokio::spawn(async move { tx.receive().await });
    peer.send(register.into()).await?;
    match recv_message(&mut from_uas).await {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::OK),
        _ => panic!("expected replayed 200"),
    }
    spin.abort();
    Ok(())
}
