use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// RFC 3261 matching: the magic-cookie branch plus the top Via sent-by
/// and the CSeq method. The role keeps a UAC and a UAS living in the same
/// process (loopback tests) from colliding on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub sent_by: HostWithPort,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.sent_by.to_string().hash(state);
    }
}

/// Pre-3261 fallback for peers whose branch lacks the magic cookie:
/// Call-ID, CSeq, From tag, and the top Via sent-by together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: String,
    pub call_id: String,
    pub sent_by: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.hash(state);
        self.call_id.hash(state);
        self.sent_by.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261(Rfc3261),
    Rfc2543(Rfc2543),
    Invalid,
}

const MAGIC_COOKIE: &str = "z9hG4bK";

impl TransactionKey {
    /// Key for a request. ACK and CANCEL reuse the INVITE's branch, so
    /// the CSeq method keeps them apart from the INVITE transaction where
    /// needed.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let method = req.method().clone();
        match via.branch() {
            Some(branch) if branch.value().starts_with(MAGIC_COOKIE) => {
                Ok(TransactionKey::Rfc3261(Rfc3261 {
                    role,
                    branch: branch.value().to_string(),
                    method,
                    sent_by: via.uri.host_with_port,
                }))
            }
            _ => Ok(TransactionKey::Rfc2543(Rfc2543 {
                role,
                method,
                cseq: req.cseq_header()?.seq()?,
                from_tag: req
                    .from_header()?
                    .tag()?
                    .ok_or(Error::TransactionError(
                        "from tag missing".to_string(),
                        TransactionKey::Invalid,
                    ))?
                    .to_string(),
                call_id: req.call_id_header()?.to_string(),
                sent_by: via.uri.host_with_port,
            })),
        }
    }

    /// Key for a response: branch plus the CSeq method, since a CANCEL's
    /// responses share the INVITE branch.
    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        match via.branch() {
            Some(branch) if branch.value().starts_with(MAGIC_COOKIE) => {
                Ok(TransactionKey::Rfc3261(Rfc3261 {
                    role,
                    branch: branch.value().to_string(),
                    method,
                    sent_by: via.uri.host_with_port,
                }))
            }
            _ => Ok(TransactionKey::Rfc2543(Rfc2543 {
                role,
                method,
                cseq: cseq.seq()?,
                from_tag: resp
                    .from_header()?
                    .tag()?
                    .ok_or(Error::TransactionError(
                        "from tag missing".to_string(),
                        TransactionKey::Invalid,
                    ))?
                    .to_string(),
                call_id: resp.call_id_header()?.to_string(),
                sent_by: via.uri.host_with_port,
            })),
        }
    }

    /// The key this message's peer-side transaction would use: same
    /// coordinates, opposite role. Lets a CANCEL find the INVITE server
    /// transaction it targets.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::Rfc3261(k) => TransactionKey::Rfc3261(Rfc3261 {
                method,
                ..k.clone()
            }),
            TransactionKey::Rfc2543(k) => TransactionKey::Rfc2543(Rfc2543 {
                method,
                ..k.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261(k) => {
                write!(
                    f,
                    "{:?}/{}/{}({})",
                    k.role, k.method, k.sent_by, k.branch
                )
            }
            TransactionKey::Rfc2543(k) => write!(
                f,
                "{:?}/{}/{} {}[{}]",
                k.role, k.method, k.cseq, k.call_id, k.sent_by
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn sample_request(branch: &str) -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Register,
            uri: rsip::Uri::try_from("sip:example.com").unwrap(),
            headers: vec![
                Via::new(format!(
                    "SIP/2.0/UDP client.example.com:5060;branch={}",
                    branch
                ))
                .into(),
                CSeq::new("2 REGISTER").into(),
                From::new("Bob <sip:bob@example.com>;tag=ja743ks76zlflH").into(),
                CallId::new("1j9FpLxk3uxtm8tn@example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_rfc3261_key() -> crate::Result<()> {
        let req = sample_request("z9hG4bKnashd92");
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        assert!(matches!(key, TransactionKey::Rfc3261(_)));
        let client_key = TransactionKey::from_request(&req, TransactionRole::Client)?;
        assert_ne!(key, client_key);
        Ok(())
    }

    #[test]
    fn test_rfc2543_fallback() -> crate::Result<()> {
        let req = sample_request("oldstylebranch");
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        assert!(matches!(key, TransactionKey::Rfc2543(_)));
        Ok(())
    }

    #[test]
    fn test_with_method() -> crate::Result<()> {
        let req = sample_request("z9hG4bKnashd92");
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        let invite_key = key.with_method(rsip::Method::Invite);
        match invite_key {
            TransactionKey::Rfc3261(k) => assert_eq!(k.method, rsip::Method::Invite),
            _ => panic!("expected RFC 3261 key"),
        }
        Ok(())
    }
}
