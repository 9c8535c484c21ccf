use super::{authenticate::handle_client_challenge, DialogId};
use super::authenticate::Credential;
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_via_branch,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared dialog state: identity, sequence numbers, routing material,
/// and the request/response builders every usage goes through.
///
/// Local CSeq is strictly monotone across outbound requests; the remote
/// CSeq high-water mark rejects regressing in-dialog requests.
pub struct DialogInner {
    pub role: TransactionRole,
    pub id: Mutex<DialogId>,
    pub cancel_token: CancellationToken,

    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,

    // the initial request's From/To; outbound builders swap them for the
    // UAS role
    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,

    pub local_contact: Option<rsip::Uri>,
    pub remote_target: Mutex<rsip::Uri>,
    pub route_set: Mutex<Vec<rsip::headers::Route>>,
    pub secure: bool,

    pub credential: Option<Credential>,
    pub(crate) endpoint: EndpointInnerRef,
    pub(crate) initial_request: Request,
}

pub type DialogInnerRef = Arc<DialogInner>;

impl DialogInner {
    pub fn new_client(
        id: DialogId,
        request: Request,
        endpoint: EndpointInnerRef,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let cseq = request.cseq_header()?.seq()?;
        let from = request.from_header()?.typed()?;
        let to = request.to_header()?.typed()?;
        let secure = request.uri.scheme == Some(rsip::Scheme::Sips);
        Ok(Self {
            role: TransactionRole::Client,
            id: Mutex::new(id),
            cancel_token: CancellationToken::new(),
            local_seq: AtomicU32::new(cseq),
            remote_seq: AtomicU32::new(0),
            from,
            to: Mutex::new(to),
            local_contact,
            remote_target: Mutex::new(request.uri.clone()),
            route_set: Mutex::new(vec![]),
            secure,
            credential,
            endpoint,
            initial_request: request,
        })
    }

    pub fn new_server(
        id: DialogId,
        request: Request,
        endpoint: EndpointInnerRef,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let cseq = request.cseq_header()?.seq()?;
        let from = request.from_header()?.typed()?;
        let mut to = request.to_header()?.typed()?;
        if !to
            .params
            .iter()
            .any(|p| matches!(p, rsip::Param::Tag(_)))
        {
            to = to.with_tag(id.to_tag.clone().into());
        }

        let remote_target = extract_uri_from_contact(request.contact_header()?.value())?;

        // the UAS stores the Record-Route set in message order
        // (RFC 3261 12.1.1); the UAC reverses it when the response lands
        let mut route_set = vec![];
        for h in request.headers.iter() {
            if let Header::RecordRoute(rr) = h {
                route_set.push(rsip::headers::Route::from(rr.value()));
            }
        }

        let secure = request.uri.scheme == Some(rsip::Scheme::Sips);
        Ok(Self {
            role: TransactionRole::Server,
            id: Mutex::new(id),
            cancel_token: CancellationToken::new(),
            local_seq: AtomicU32::new(1),
            remote_seq: AtomicU32::new(cseq),
            from,
            to: Mutex::new(to),
            local_contact,
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            secure,
            endpoint,
            credential: None,
            initial_request: request,
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn local_tag(&self) -> String {
        let id = self.id.lock().unwrap();
        match self.role {
            TransactionRole::Client => id.from_tag.clone(),
            TransactionRole::Server => id.to_tag.clone(),
        }
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Accept an in-dialog request only if its CSeq does not regress
    /// (RFC 3261 12.2.2). The caller answers 500 when this is false.
    pub fn validate_remote_seq(&self, cseq: u32) -> bool {
        let current = self.remote_seq.load(Ordering::Relaxed);
        if current > 0 && cseq < current {
            return false;
        }
        self.remote_seq.fetch_max(cseq, Ordering::Relaxed);
        true
    }

    pub fn update_remote_tag(&self, tag: &str) {
        let mut id = self.id.lock().unwrap();
        match self.role {
            TransactionRole::Client => id.to_tag = tag.to_string(),
            TransactionRole::Server => id.from_tag = tag.to_string(),
        }
        if self.role == TransactionRole::Client {
            let mut to = self.to.lock().unwrap();
            *to = to.clone().with_tag(tag.into());
        }
    }

    /// Absorb routing material from a dialog-establishing response:
    /// remote target from Contact, route set from Record-Route reversed
    /// (RFC 3261 12.1.2).
    pub fn apply_response_routing(&self, resp: &Response) {
        if let Some(contact) = resp.contact_header().ok() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                *self.remote_target.lock().unwrap() = uri;
            }
        }
        let mut routes = vec![];
        for h in resp.headers().iter() {
            if let Header::RecordRoute(rr) = h {
                routes.push(rsip::headers::Route::from(rr.value()));
            }
        }
        if !routes.is_empty() {
            routes.reverse();
            *self.route_set.lock().unwrap() = routes;
        }
    }

    pub fn set_remote_target(&self, uri: rsip::Uri) {
        *self.remote_target.lock().unwrap() = uri;
    }

    /// Build an in-dialog request per RFC 3261 12.2.1: Request-URI from
    /// the remote target, Route headers from the stored route set.
    pub fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let mut headers = headers.unwrap_or_default();
        let seq = cseq.unwrap_or_else(|| self.increment_local_seq());

        let via = self.endpoint.get_via(None, Some(make_via_branch()))?;
        headers.push(Header::Via(via.into()));
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));

        let from_value = self.from.clone().untyped().value().to_string();
        let to_value = self.to.lock().unwrap().clone().untyped().value().to_string();
        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(from_value.into()));
                headers.push(Header::To(to_value.into()));
            }
            TransactionRole::Server => {
                headers.push(Header::From(to_value.into()));
                headers.push(Header::To(from_value.into()));
            }
        }
        headers.push(Header::CSeq(CSeq { seq, method }.into()));
        headers.push(Header::MaxForwards(70.into()));
        headers.push(Header::UserAgent(
            self.endpoint.user_agent.clone().into(),
        ));
        if let Some(contact) = self.local_contact.as_ref() {
            headers.push(Contact::from(contact.clone()).into());
        }
        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method,
            uri: self.remote_target.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    pub fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(via) => resp_headers.push(Header::Via(via.clone())),
                Header::From(from) => resp_headers.push(Header::From(from.clone())),
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!("failed to parse To header: {}", e);
                            continue;
                        }
                    };
                    let local_tag = self.local_tag();
                    if self.role == TransactionRole::Server
                        && status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_)))
                        && !local_tag.is_empty()
                    {
                        to = to.with_tag(local_tag.into());
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => resp_headers.push(Header::CSeq(cseq.clone())),
                Header::CallId(call_id) => resp_headers.push(Header::CallId(call_id.clone())),
                Header::RecordRoute(rr) => {
                    resp_headers.push(Header::RecordRoute(rr.clone()));
                }
                _ => {}
            }
        }
        if let Some(contact) = self.local_contact.as_ref() {
            resp_headers.push(Contact::from(contact.clone()).into());
        }
        if let Some(extra) = headers {
            for header in extra {
                resp_headers.unique_push(header);
            }
        }
        resp_headers.retain(|h| !matches!(h, Header::ContentLength(_)));
        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// ACK for a 2xx travels outside any transaction, straight through
    /// the selector to the remote target.
    pub async fn send_ack(&self, cseq: u32, body: Option<Vec<u8>>) -> Result<()> {
        let mut headers = vec![];
        if body.is_some() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        let ack = self.make_request(Method::Ack, Some(cseq), Some(headers), body)?;
        self.send_outside_transaction(ack.into()).await
    }

    pub(crate) async fn send_outside_transaction(&self, msg: SipMessage) -> Result<()> {
        let uri = match &msg {
            SipMessage::Request(req) => req.uri.clone(),
            SipMessage::Response(_) => self.remote_target.lock().unwrap().clone(),
        };
        let route_uri = self.first_route_uri();
        let msg_len = msg.to_string().len();
        let (connection, target) = self
            .endpoint
            .selector
            .select(&uri, route_uri.as_ref(), msg_len)
            .await?;
        connection.send(msg, Some(&target)).await
    }

    fn first_route_uri(&self) -> Option<rsip::Uri> {
        let route_set = self.route_set.lock().unwrap();
        route_set
            .first()
            .and_then(|r| r.typed().ok())
            .and_then(|r| r.uris().first().map(|u| u.uri.clone()))
    }

    /// Send an in-dialog request through a client transaction and wait
    /// for its final response, retrying once over a 401/407 challenge.
    pub async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let mut tx = self.new_client_transaction(request)?;
        tx.send().await?;

        let mut challenged = false;
        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };
            match resp.status_code {
                StatusCode::Trying => continue,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    if challenged {
                        debug!("second auth challenge, giving up");
                        return Ok(Some(resp));
                    }
                    let cred = match &self.credential {
                        Some(cred) => cred.clone(),
                        None => return Ok(Some(resp)),
                    };
                    challenged = true;
                    let new_seq = self.increment_local_seq();
                    tx = handle_client_challenge(
                        new_seq,
                        tx,
                        resp,
                        &cred,
                    )?;
                    tx.send().await?;
                }
                _ => {
                    if resp.status_code.kind() == StatusCodeKind::Provisional {
                        continue;
                    }
                    return Ok(Some(resp));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn new_client_transaction(&self, request: Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        if let Some(route_uri) = self.first_route_uri() {
            match SipAddr::try_from(&route_uri) {
                Ok(addr) => {
                    tx.destination = Some(addr);
                }
                Err(e) => warn!("unusable route target: {}", e),
            }
        }
        Ok(tx)
    }
}
