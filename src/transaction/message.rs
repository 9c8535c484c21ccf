use crate::Result;
use rsip::{prelude::HeadersExt, Header, Request, Response, StatusCode};

/// Build a response that mirrors the request's identity headers. Used
/// both for real replies and for the synthetic 408/503 the transaction
/// layer feeds upward.
pub fn make_response(req: &Request, status_code: StatusCode, body: Option<Vec<u8>>) -> Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::CallId(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CSeq(_)
        )
    });
    let body = body.unwrap_or_default();
    headers.unique_push(Header::ContentLength((body.len() as u32).into()));
    Response {
        status_code,
        version: req.version().clone(),
        headers,
        body,
    }
}

/// ACK for a non-2xx final response, sent inside the INVITE transaction
/// (RFC 3261 17.1.1.3): same branch and Request-URI as the INVITE, To
/// copied from the response so the tag matches.
pub fn make_ack_for_error(invite: &Request, response: &Response) -> Result<Request> {
    let mut headers = rsip::Headers::default();
    headers.push(Header::Via(invite.via_header()?.clone()));
    headers.push(Header::From(invite.from_header()?.clone()));
    headers.push(Header::To(response.to_header()?.clone()));
    headers.push(Header::CallId(invite.call_id_header()?.clone()));
    headers.push(Header::CSeq(
        rsip::typed::CSeq {
            seq: invite.cseq_header()?.seq()?,
            method: rsip::Method::Ack,
        }
        .into(),
    ));
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::ContentLength(0.into()));
    Ok(Request {
        method: rsip::Method::Ack,
        uri: invite.uri.clone(),
        headers,
        body: vec![],
        version: rsip::Version::V2,
    })
}

/// CANCEL matching an outstanding INVITE: identical identity headers and
/// branch, CSeq number preserved with the CANCEL method (RFC 3261 9.1).
pub fn make_cancel(invite: &Request) -> Result<Request> {
    let mut headers = rsip::Headers::default();
    headers.push(Header::Via(invite.via_header()?.clone()));
    headers.push(Header::From(invite.from_header()?.clone()));
    headers.push(Header::To(invite.to_header()?.clone()));
    headers.push(Header::CallId(invite.call_id_header()?.clone()));
    headers.push(Header::CSeq(
        rsip::typed::CSeq {
            seq: invite.cseq_header()?.seq()?,
            method: rsip::Method::Cancel,
        }
        .into(),
    ));
    for h in invite.headers.iter() {
        if let Header::Route(route) = h {
            headers.push(Header::Route(route.clone()));
        }
    }
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::ContentLength(0.into()));
    Ok(Request {
        method: rsip::Method::Cancel,
        uri: invite.uri.clone(),
        headers,
        body: vec![],
        version: rsip::Version::V2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;
    use rsip::prelude::ToTypedHeader;

    fn sample_invite() -> Request {
        Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds").into(),
                CSeq::new("7 INVITE").into(),
                From::new("Alice <sip:alice@example.com>;tag=88sja8x").into(),
                To::new("Bob <sip:bob@example.com>").into(),
                CallId::new("987asjd97y7atg@example.com").into(),
                MaxForwards::new("70").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn test_make_response_mirrors_identity() {
        let req = sample_invite();
        let resp = make_response(&req, StatusCode::Ringing, None);
        assert_eq!(resp.status_code, StatusCode::Ringing);
        assert!(resp.via_header().is_ok());
        assert!(resp.cseq_header().is_ok());
    }

    #[test]
    fn test_make_cancel_keeps_branch_and_cseq() -> crate::Result<()> {
        let invite = sample_invite();
        let cancel = make_cancel(&invite)?;
        assert_eq!(cancel.method, rsip::Method::Cancel);
        assert_eq!(
            cancel.via_header()?.to_string(),
            invite.via_header()?.to_string()
        );
        assert_eq!(cancel.cseq_header()?.seq()?, 7);
        Ok(())
    }

    #[test]
    fn test_ack_for_error_takes_to_tag_from_response() -> crate::Result<()> {
        let invite = sample_invite();
        let mut resp = make_response(&invite, StatusCode::BusyHere, None);
        let to = resp.to_header()?.typed()?.with_tag("remote-tag".into());
        resp.headers.retain(|h| !matches!(h, Header::To(_)));
        resp.headers.push(Header::To(to.into()));

        let ack = make_ack_for_error(&invite, &resp)?;
        assert_eq!(ack.method, rsip::Method::Ack);
        assert!(ack.to_header()?.to_string().contains("remote-tag"));
        assert_eq!(ack.cseq_header()?.seq()?, 7);
        Ok(())
    }
}
