//! Dialog identity and CSeq discipline.

use super::{create_invite_request, create_test_endpoint};
use crate::dialog::{dialog::DialogInner, DialogId, DialogSetId};
use rsip::prelude::{HeadersExt, UntypedHeader};

#[test]
fn test_dialog_id_is_symmetric() {
    let uac_view = DialogId {
        call_id: "call-1".into(),
        from_tag: "alice".into(),
        to_tag: "bob".into(),
    };
    let uas_view = DialogId {
        call_id: "call-1".into(),
        from_tag: "bob".into(),
        to_tag: "alice".into(),
    };
    assert_eq!(uac_view, uas_view);

    let mut set = std::collections::HashSet::new();
    set.insert(uac_view.clone());
    assert!(set.contains(&uas_view));

    let other_call = DialogId {
        call_id: "call-2".into(),
        from_tag: "alice".into(),
        to_tag: "bob".into(),
    };
    assert_ne!(uac_view, other_call);
}

#[test]
fn test_dialog_id_from_messages() {
    let req = create_invite_request("alice-tag", "", "call-7");
    let id = DialogId::try_from(&req).expect("dialog id");
    assert_eq!(id.from_tag, "alice-tag");
    assert!(id.to_tag.is_empty());
    assert!(!id.is_confirmed());

    let set_id = DialogSetId::from(&id);
    assert_eq!(set_id.call_id, "call-7");
    assert_eq!(set_id.local_tag, "alice-tag");
}

#[tokio::test]
async fn test_local_cseq_strictly_monotone() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint("alice.example.com:5060").await?;

    let req = create_invite_request("alice-tag", "", "call-cseq");
    let mut id = DialogId::try_from(&req)?;
    id.to_tag = "bob-tag".into();
    let dialog = DialogInner::new_client(id, req, endpoint.inner.clone(), None, None)?;

    let mut last = dialog.get_local_seq();
    for _ in 0..5 {
        let request = dialog.make_request(rsip::Method::Info, None, None, None)?;
        let seq = request.cseq_header()?.seq()?;
        assert!(seq > last, "CSeq must strictly increase: {} -> {}", last, seq);
        last = seq;
    }
    Ok(())
}

#[tokio::test]
async fn test_remote_cseq_never_decreases() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint("bob.example.com:5060").await?;

    let req = create_invite_request("alice-tag", "", "call-remote-cseq");
    let mut id = DialogId::try_from(&req)?;
    id.to_tag = "bob-tag".into();
    let dialog = DialogInner::new_server(id, req, endpoint.inner.clone(), None)?;

    // the INVITE carried CSeq 1
    assert!(dialog.validate_remote_seq(2));
    assert!(dialog.validate_remote_seq(2), "equal CSeq is a retransmission, not a regression");
    assert!(dialog.validate_remote_seq(7));
    assert!(!dialog.validate_remote_seq(3), "regressions must be rejected");
    assert!(dialog.validate_remote_seq(7));
    Ok(())
}

#[tokio::test]
async fn test_uas_route_set_kept_in_message_order() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint("bob.example.com:5060").await?;

    let req = create_invite_request("alice-tag", "", "call-routes");
    let mut id = DialogId::try_from(&req)?;
    id.to_tag = "bob-tag".into();
    let dialog = DialogInner::new_server(id, req, endpoint.inner.clone(), None)?;

    let routes = dialog.route_set.lock().unwrap();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].to_string().contains("proxy1"));
    assert!(routes[1].to_string().contains("proxy2"));
    Ok(())
}

#[tokio::test]
async fn test_uac_reverses_record_route_from_response() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint("alice.example.com:5060").await?;

    let req = create_invite_request("alice-tag", "", "call-routes-uac");
    let dialog =
        DialogInner::new_client(DialogId::try_from(&req)?, req, endpoint.inner.clone(), None, None)?;

    let resp = rsip::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: vec![
            rsip::headers::Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds")
                .into(),
            rsip::headers::From::new("Alice <sip:alice@example.com>;tag=alice-tag").into(),
            rsip::headers::To::new("Bob <sip:bob@example.com>;tag=bob-tag").into(),
            rsip::headers::CallId::new("call-routes-uac").into(),
            rsip::headers::CSeq::new("1 INVITE").into(),
            rsip::headers::Contact::new("<sip:bob@host.example.com>").into(),
            rsip::headers::RecordRoute::new("<sip:proxy1.example.com;lr>").into(),
            rsip::headers::RecordRoute::new("<sip:proxy2.example.com;lr>").into(),
        ]
        .into(),
        body: vec![],
    };
    dialog.apply_response_routing(&resp);

    let routes = dialog.route_set.lock().unwrap();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].to_string().contains("proxy2"), "UAC stores the set reversed");
    assert!(routes[1].to_string().contains("proxy1"));
    drop(routes);

    let target = dialog.remote_target.lock().unwrap();
    assert_eq!(target.host_with_port.to_string(), "host.example.com");
    Ok(())
}

#[tokio::test]
async fn test_make_request_targets_remote_and_carries_routes() -> crate::Result<()> {
    let (endpoint, _peer) = create_test_endpoint("bob.example.com:5060").await?;

    let req = create_invite_request("alice-tag", "", "call-build");
    let mut id = DialogId::try_from(&req)?;
    id.to_tag = "bob-tag".into();
    let dialog = DialogInner::new_server(id, req, endpoint.inner.clone(), None)?;

    let bye = dialog.make_request(rsip::Method::Bye, None, None, None)?;
    // RFC 3261 12.2.1: Request-URI is the remote target (the Contact)
    assert_eq!(bye.uri.host_with_port.to_string(), "alice.example.com:5060");
    let route_count = bye
        .headers
        .iter()
        .filter(|h| matches!(h, rsip::Header::Route(_)))
        .count();
    assert_eq!(route_count, 2);
    // the UAS answers with swapped identity headers
    assert!(bye.from_header()?.to_string().contains("bob-tag"));
    assert!(bye.to_header()?.to_string().contains("alice-tag"));
    Ok(())
}
