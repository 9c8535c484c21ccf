use crate::rsip_ext::RsipHeadersExt;
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    make_via_branch, random_text,
    transaction::Transaction,
    CNONCE_LEN,
};
use crate::Result;
use rsip::headers::auth::AuthQop;
use rsip::prelude::{HasHeaders, HeadersExt, ToTypedHeader};
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization, WwwAuthenticate};
use rsip::{Header, Param, Response, StatusCode};

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

fn extract_challenge(resp: &Response) -> Result<(WwwAuthenticate, bool)> {
    for header in resp.headers().iter() {
        match header {
            Header::WwwAuthenticate(h) => return Ok((h.typed()?, false)),
            Header::ProxyAuthenticate(h) => return Ok((h.typed()?.0, true)),
            _ => {}
        }
    }
    Err(crate::Error::Error(
        "challenge response carries no authenticate header".to_string(),
    ))
}

/// Answer a 401/407 by rebuilding the request with a digest response and
/// a fresh branch (RFC 3261 22.2/22.3). Returns the replacement client
/// transaction, ready to send.
pub fn handle_client_challenge(
    new_seq: u32,
    tx: Transaction,
    resp: Response,
    cred: &Credential,
) -> Result<Transaction> {
    let proxy = resp.status_code == StatusCode::ProxyAuthenticationRequired;
    let (challenge, from_proxy_header) = extract_challenge(&resp)?;

    let mut new_req = tx.original.clone();
    new_req.cseq_header_mut()?.mut_seq(new_seq)?;

    let auth_qop = challenge.qop.as_ref().map(|_| AuthQop::Auth {
        cnonce: random_text(CNONCE_LEN),
        nc: 1,
    });

    let generator = DigestGenerator {
        username: cred.username.as_str(),
        password: cred.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &tx.original.method,
        qop: auth_qop.as_ref(),
        uri: &tx.original.uri,
        realm: challenge.realm.as_str(),
    };

    let auth = Authorization {
        scheme: challenge.scheme,
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: tx.original.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque,
        qop: auth_qop,
    };

    // retry is a new transaction: replace the branch
    let via = tx.original.via_header()?.typed()?;
    let mut params = via.params.clone();
    params.retain(|p| !matches!(p, Param::Branch(_)));
    params.push(make_via_branch());
    let via = rsip::typed::Via { params, ..via };
    new_req
        .headers_mut()
        .retain(|h| !matches!(h, Header::Via(_)));
    new_req.headers_mut().push_front(Header::Via(via.into()));

    new_req.headers_mut().retain(|h| {
        !matches!(
            h,
            Header::Authorization(_) | Header::ProxyAuthorization(_)
        )
    });
    if proxy || from_proxy_header {
        new_req
            .headers_mut()
            .unique_push(ProxyAuthorization(auth).into());
    } else {
        new_req.headers_mut().unique_push(auth.into());
    }

    let key = TransactionKey::from_request(&new_req, TransactionRole::Client)?;
    let new_tx = Transaction::new_client(key, new_req, tx.endpoint_inner.clone(), tx.connection.clone());
    Ok(new_tx)
}
