use super::{
    authenticate::Credential,
    dialog::DialogInner,
    dialog_layer::DialogLayer,
    session::{InviteSession, SessionState},
    DialogId,
};
use crate::{
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag, make_via_branch,
        transaction::Transaction,
    },
    Result,
};
use rsip::Header;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to place an outbound call.
pub struct InviteOption {
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub contact: rsip::Uri,
    pub offer: Option<Vec<u8>>,
    pub credential: Option<Credential>,
    /// extra headers copied onto the INVITE verbatim
    pub headers: Option<Vec<Header>>,
    pub supports_100rel: bool,
}

impl DialogLayer {
    fn make_invite_request(&self, opt: &InviteOption, from_tag: &str) -> Result<rsip::Request> {
        let from = rsip::typed::From {
            display_name: None,
            uri: opt.caller.clone(),
            params: vec![],
        }
        .with_tag(from_tag.into());
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let via = self.inner.endpoint.get_via(None, Some(make_via_branch()))?;

        let mut headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(None)),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: 1,
                    method: rsip::Method::Invite,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.inner.endpoint.user_agent.clone().into()),
            rsip::typed::Contact {
                display_name: None,
                uri: opt.contact.clone(),
                params: vec![],
            }
            .into(),
        ];
        if opt.supports_100rel {
            headers.push(Header::Other("Supported".into(), "100rel".into()));
        }
        if let Some(extra) = &opt.headers {
            headers.extend(extra.iter().cloned());
        }
        if opt.offer.is_some() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        let body = opt.offer.clone().unwrap_or_default();
        headers.push(Header::ContentLength((body.len() as u32).into()));

        Ok(rsip::Request {
            method: rsip::Method::Invite,
            uri: opt.callee.clone(),
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        })
    }

    /// Place a call: build the INVITE, register the early dialog, and
    /// drive the client transaction on its own task. The returned
    /// session is in `UacStart`; progress arrives on the layer's event
    /// channel.
    pub fn invite(&self, opt: InviteOption) -> Result<InviteSession> {
        let from_tag = make_tag().to_string();
        let request = self.make_invite_request(&opt, &from_tag)?;
        let offer = opt.offer.clone();

        let id = DialogId::try_from(&request)?;
        let dialog = DialogInner::new_client(
            id.clone(),
            request.clone(),
            self.inner.endpoint.clone(),
            opt.credential,
            Some(opt.contact),
        )?;
        let events = self.inner.event_sender()?;
        let session = InviteSession::new(
            Arc::new(dialog),
            events,
            Arc::downgrade(&self.inner),
            SessionState::UacStart,
        );
        self.inner.register_session(session.clone());
        info!("new UAC session {}", id);

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let tx = Transaction::new_client(key, request, self.inner.endpoint.clone(), None);

        let process = session.clone();
        tokio::spawn(async move {
            if let Err(e) = process.process_uac_invite(tx, offer).await {
                warn!("UAC INVITE processing failed: {}", e);
            }
        });
        Ok(session)
    }
}
