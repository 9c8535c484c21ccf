use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod dialog;
pub mod dialog_layer;
pub mod dialog_set;
pub mod invitation;
pub mod session;
pub mod subscription;

#[cfg(test)]
mod tests;

/// RFC 3261 dialog identity: Call-ID plus both tags. The remote tag is
/// empty while the dialog is early and unconfirmed.
///
/// Equality and hashing are symmetric in the two tags so the UAC and UAS
/// views of the same dialog compare equal.
#[derive(Clone, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl PartialEq for DialogId {
    fn eq(&self, other: &DialogId) -> bool {
        if self.call_id != other.call_id {
            return false;
        }
        (self.from_tag == other.from_tag && self.to_tag == other.to_tag)
            || (self.from_tag == other.to_tag && self.to_tag == other.from_tag)
    }
}

impl Eq for DialogId {}

impl std::hash::Hash for DialogId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        if self.from_tag > self.to_tag {
            self.from_tag.hash(state);
            self.to_tag.hash(state);
        } else {
            self.to_tag.hash(state);
            self.from_tag.hash(state);
        }
    }
}

impl DialogId {
    pub fn is_confirmed(&self) -> bool {
        !self.from_tag.is_empty() && !self.to_tag.is_empty()
    }
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = Error;

    fn try_from(request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let from_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let to_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&rsip::Response> for DialogId {
    type Error = Error;

    fn try_from(resp: &rsip::Response) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();
        let from_tag = match resp.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let to_tag = match resp.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from_tag > self.to_tag {
            write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
        } else {
            write!(f, "{}-{}-{}", self.call_id, self.to_tag, self.from_tag)
        }
    }
}

/// Identity of a dialog set: Call-ID plus the local tag. Every dialog a
/// forking proxy spawns from one INVITE shares these, so the set is the
/// unit that fork policy operates on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogSetId {
    pub call_id: String,
    pub local_tag: String,
}

impl DialogSetId {
    pub fn new(call_id: &str, local_tag: &str) -> Self {
        DialogSetId {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
        }
    }
}

impl From<&DialogId> for DialogSetId {
    fn from(id: &DialogId) -> Self {
        DialogSetId {
            call_id: id.call_id.clone(),
            local_tag: id.from_tag.clone(),
        }
    }
}

impl std::fmt::Display for DialogSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.call_id, self.local_tag)
    }
}
