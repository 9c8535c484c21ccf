//! Subscription usages (RFC 6665 shape, enough for presence/dialog
//! packages and the implicit REFER subscription). A dialog hosts at most
//! one INVITE usage but any number of subscriptions; the layer routes
//! SUBSCRIBE and NOTIFY here when a subscription usage owns the dialog.

use super::{
    dialog::{DialogInner, DialogInnerRef},
    session::{SessionEvent, SessionEventSender},
    DialogId,
};
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag, make_via_branch,
        transaction::Transaction,
    },
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const DEFAULT_EXPIRES: u32 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

pub(crate) struct SubscriptionInner {
    pub dialog: DialogInnerRef,
    pub event_package: String,
    state: Mutex<SubscriptionState>,
    expires: Mutex<u32>,
    events: SessionEventSender,
    incoming: bool,
}

/// One subscription attached to a dialog, either side.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub(crate) fn new(
        dialog: DialogInnerRef,
        event_package: String,
        expires: u32,
        events: SessionEventSender,
        incoming: bool,
    ) -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                dialog,
                event_package,
                state: Mutex::new(SubscriptionState::Pending),
                expires: Mutex::new(expires),
                events,
                incoming,
            }),
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.dialog.id()
    }

    pub fn event_package(&self) -> &str {
        &self.inner.event_package
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.events.send((self.id(), event)).ok();
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Notifier side: push the current resource state. `terminated` ends
    /// the usage (Subscription-State: terminated).
    pub async fn notify(&self, content_type: &str, body: Vec<u8>, terminated: bool) -> Result<()> {
        let sub_state = if terminated {
            "terminated;reason=noresource".to_string()
        } else {
            format!("active;expires={}", *self.inner.expires.lock().unwrap())
        };
        let headers = vec![
            Header::Other("Event".into(), self.inner.event_package.clone()),
            Header::Other("Subscription-State".into(), sub_state),
            Header::ContentType(content_type.to_string().into()),
        ];
        let request = self
            .inner
            .dialog
            .make_request(Method::Notify, None, Some(headers), Some(body))?;
        let resp = self.inner.dialog.do_request(request).await?;
        if terminated {
            self.set_state(SubscriptionState::Terminated);
        } else if let Some(resp) = resp {
            if resp.status_code.kind() == StatusCodeKind::Successful {
                self.set_state(SubscriptionState::Active);
            }
        }
        Ok(())
    }

    /// Subscriber side: refresh (or with `expires` 0, terminate) the
    /// subscription.
    pub async fn refresh(&self, expires: u32) -> Result<()> {
        let headers = vec![
            Header::Other("Event".into(), self.inner.event_package.clone()),
            Header::Expires(expires.into()),
        ];
        let request =
            self.inner
                .dialog
                .make_request(Method::Subscribe, None, Some(headers), None)?;
        let resp = self.inner.dialog.do_request(request).await?;
        match resp {
            Some(resp) if resp.status_code.kind() == StatusCodeKind::Successful => {
                *self.inner.expires.lock().unwrap() = expires;
                if expires == 0 {
                    self.set_state(SubscriptionState::Terminated);
                }
                Ok(())
            }
            Some(resp) => Err(Error::DialogError(
                format!("subscription refresh rejected with {}", resp.status_code),
                self.id(),
            )),
            None => Err(Error::DialogError(
                "subscription refresh got no response".to_string(),
                self.id(),
            )),
        }
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.refresh(0).await
    }

    /// In-dialog request routed to this usage by the layer.
    pub(crate) async fn handle_request(&self, mut tx: Transaction) -> Result<()> {
        let cseq = tx.original.cseq_header()?.seq()?;
        if !self.inner.dialog.validate_remote_seq(cseq) {
            tx.reply(StatusCode::ServerInternalError).await?;
            return Ok(());
        }
        match tx.original.method {
            Method::Subscribe => {
                let expires = parse_expires(&tx.original).unwrap_or(DEFAULT_EXPIRES);
                *self.inner.expires.lock().unwrap() = expires;
                tx.reply_with(
                    StatusCode::OK,
                    vec![Header::Expires(expires.into())],
                    None,
                )
                .await?;
                if expires == 0 {
                    self.set_state(SubscriptionState::Terminated);
                    self.emit(SessionEvent::SubscriptionTerminated);
                } else {
                    self.set_state(SubscriptionState::Active);
                }
                Ok(())
            }
            Method::Notify => {
                let terminated = tx
                    .original
                    .headers
                    .iter()
                    .any(|h| {
                        let line = h.to_string().to_ascii_lowercase();
                        line.starts_with("subscription-state")
                            && line.contains("terminated")
                    });
                let body = tx.original.body.clone();
                tx.reply(StatusCode::OK).await?;
                self.emit(SessionEvent::NotifyReceived {
                    event_package: self.inner.event_package.clone(),
                    body,
                    terminated,
                });
                if terminated {
                    self.set_state(SubscriptionState::Terminated);
                    self.emit(SessionEvent::SubscriptionTerminated);
                }
                Ok(())
            }
            _ => {
                tx.reply(StatusCode::MethodNotAllowed).await?;
                Ok(())
            }
        }
    }
}

pub(crate) fn parse_expires(req: &rsip::Request) -> Option<u32> {
    req.headers.iter().find_map(|h| match h {
        Header::Expires(e) => e.value().trim().parse().ok(),
        _ => None,
    })
}

pub(crate) fn parse_event_package(req: &rsip::Request) -> Option<String> {
    req.headers.iter().find_map(|h| {
        let line = h.to_string();
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case("Event") {
            Some(v.trim().split(';').next().unwrap_or("").to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_request(event_line: &str, expires: u32) -> rsip::Request {
        use rsip::headers::*;
        rsip::Request {
            method: Method::Subscribe,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new("SIP/2.0/UDP watcher.example.com:5060;branch=z9hG4bKsub1").into(),
                CSeq::new("1 SUBSCRIBE").into(),
                From::new("Watcher <sip:watcher@example.com>;tag=wtag").into(),
                To::new("Bob <sip:bob@example.com>").into(),
                CallId::new("sub1@watcher.example.com").into(),
                Contact::new("<sip:watcher@watcher.example.com:5060>").into(),
                rsip::Header::Other("Event".into(), event_line.into()),
                Expires::new(expires.to_string()).into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn test_parse_event_package_strips_params() {
        let req = subscribe_request("presence;id=55", 600);
        assert_eq!(parse_event_package(&req).as_deref(), Some("presence"));
    }

    #[test]
    fn test_parse_expires() {
        let req = subscribe_request("dialog", 1800);
        assert_eq!(parse_expires(&req), Some(1800));
    }
}

/// Everything needed to start an outbound subscription.
pub struct SubscribeOption {
    pub subscriber: rsip::Uri,
    pub target: rsip::Uri,
    pub contact: rsip::Uri,
    pub event_package: String,
    pub expires: u32,
}

impl super::dialog_layer::DialogLayer {
    /// Subscriber side: SUBSCRIBE out of dialog, build the usage when
    /// the 200 establishes the dialog.
    pub async fn subscribe(&self, opt: SubscribeOption) -> Result<Subscription> {
        let from_tag = make_tag().to_string();
        let from = rsip::typed::From {
            display_name: None,
            uri: opt.subscriber.clone(),
            params: vec![],
        }
        .with_tag(from_tag.into());
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.target.clone(),
            params: vec![],
        };
        let via = self.inner.endpoint.get_via(None, Some(make_via_branch()))?;
        let headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(None)),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: 1,
                    method: Method::Subscribe,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::Other("Event".into(), opt.event_package.clone()),
            Header::Expires(opt.expires.into()),
            rsip::typed::Contact {
                display_name: None,
                uri: opt.contact.clone(),
                params: vec![],
            }
            .into(),
            Header::ContentLength(0.into()),
        ];
        let request = rsip::Request {
            method: Method::Subscribe,
            uri: opt.target,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        };

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request.clone(), self.inner.endpoint.clone(), None);
        tx.send().await?;

        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };
            match resp.status_code.kind() {
                StatusCodeKind::Provisional => continue,
                StatusCodeKind::Successful => {
                    let id = DialogId::try_from(&resp)?;
                    let dialog = DialogInner::new_client(
                        id.clone(),
                        request,
                        self.inner.endpoint.clone(),
                        None,
                        Some(opt.contact),
                    )?;
                    dialog.update_remote_tag(&id.to_tag);
                    if let Ok(contact) = resp.contact_header() {
                        if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                            dialog.set_remote_target(uri);
                        }
                    }
                    let subscription = Subscription::new(
                        Arc::new(dialog),
                        opt.event_package,
                        opt.expires,
                        self.inner.event_sender()?,
                        false,
                    );
                    subscription.set_state(SubscriptionState::Active);
                    self.inner.attach_subscription(subscription.clone());
                    info!("client subscription established: {}", subscription.id());
                    return Ok(subscription);
                }
                _ => {
                    let id = DialogId::try_from(&request).unwrap_or(DialogId {
                        call_id: String::new(),
                        from_tag: String::new(),
                        to_tag: String::new(),
                    });
                    return Err(Error::DialogError(
                        format!("SUBSCRIBE rejected with {}", resp.status_code),
                        id,
                    ));
                }
            }
        }
        Err(Error::DialogError(
            "SUBSCRIBE transaction ended without response".to_string(),
            DialogId {
                call_id: String::new(),
                from_tag: String::new(),
                to_tag: String::new(),
            },
        ))
    }

    /// Notifier side: accept an out-of-dialog SUBSCRIBE, creating the
    /// dialog and the server usage.
    pub(crate) async fn accept_uas_subscribe(
        &self,
        mut id: DialogId,
        mut tx: Transaction,
    ) -> Result<()> {
        let Some(event_package) = parse_event_package(&tx.original) else {
            tx.reply(StatusCode::BadRequest).await?;
            return Ok(());
        };
        id.to_tag = make_tag().to_string();
        let expires = parse_expires(&tx.original).unwrap_or(DEFAULT_EXPIRES);
        let dialog = DialogInner::new_server(
            id.clone(),
            tx.original.clone(),
            self.inner.endpoint.clone(),
            self.local_contact(),
        )?;
        let subscription = Subscription::new(
            Arc::new(dialog),
            event_package.clone(),
            expires,
            self.inner.event_sender()?,
            true,
        );
        self.inner.attach_subscription(subscription.clone());

        let resp = subscription.inner.dialog.make_response(
            &tx.original,
            StatusCode::OK,
            Some(vec![Header::Expires(expires.into())]),
            None,
        );
        tx.respond(resp).await?;
        subscription.set_state(SubscriptionState::Active);
        debug!("server subscription {} for {}", id, event_package);
        subscription.emit(SessionEvent::NewSubscription {
            event_package,
            incoming: true,
        });
        Ok(())
    }
}
