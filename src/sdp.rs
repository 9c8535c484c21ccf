//! Offer/answer helpers over SDP bodies.
//!
//! The stack treats session descriptions as opaque except for the pieces
//! the conversation layer negotiates: validity, the connection line, and
//! the RFC 4566 direction attributes that carry hold state. Parsing goes
//! through `sdp_rs`; direction rewriting works on the serialized text so
//! unknown attributes pass through untouched.

use crate::Result;

pub use sdp_rs::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// A peer offering sendonly or inactive is holding us.
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }

    /// The direction we offer when putting the peer on hold: sending
    /// stops being expected from them, so sendrecv degrades to sendonly
    /// and recvonly to inactive (RFC 3264 section 5.1).
    pub fn hold(&self) -> Self {
        match self {
            MediaDirection::SendRecv | MediaDirection::SendOnly => MediaDirection::SendOnly,
            MediaDirection::RecvOnly | MediaDirection::Inactive => MediaDirection::Inactive,
        }
    }

    /// Mirror an offered direction into the answer (RFC 3264 6.1).
    pub fn answer(&self) -> Self {
        match self {
            MediaDirection::SendRecv => MediaDirection::SendRecv,
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            MediaDirection::Inactive => MediaDirection::Inactive,
        }
    }
}

impl std::fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse(body: &[u8]) -> Result<SessionDescription> {
    let text = std::str::from_utf8(body)
        .map_err(|e| crate::Error::SdpError(format!("body is not utf-8: {}", e)))?;
    SessionDescription::try_from(text)
        .map_err(|e| crate::Error::SdpError(format!("invalid SDP: {:?}", e)))
}

/// The effective direction of a description: the last direction
/// attribute wins, media level over session level; absent means
/// sendrecv.
pub fn direction_of(sdp_text: &str) -> MediaDirection {
    let mut session_dir = None;
    let mut media_dir = None;
    let mut in_media = false;
    for line in sdp_text.lines() {
        let line = line.trim_end();
        if line.starts_with("m=") {
            in_media = true;
            continue;
        }
        if let Some(token) = line.strip_prefix("a=") {
            if let Some(dir) = MediaDirection::from_token(token) {
                if in_media {
                    media_dir = Some(dir);
                } else {
                    session_dir = Some(dir);
                }
            }
        }
    }
    media_dir.or(session_dir).unwrap_or_default()
}

/// Rewrite a description to carry exactly one direction attribute per
/// media section. Everything else passes through byte for byte.
pub fn with_direction(sdp_text: &str, direction: MediaDirection) -> String {
    let mut out = Vec::new();
    let mut saw_media = false;
    for line in sdp_text.lines() {
        let trimmed = line.trim_end();
        if let Some(token) = trimmed.strip_prefix("a=") {
            if MediaDirection::from_token(token).is_some() {
                continue;
            }
        }
        if trimmed.starts_with("m=") {
            saw_media = true;
            out.push(trimmed.to_string());
            out.push(format!("a={}", direction));
            continue;
        }
        out.push(trimmed.to_string());
    }
    if !saw_media {
        out.push(format!("a={}", direction));
    }
    let mut text = out.join("\r\n");
    text.push_str("\r\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 atlanta.example.com\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.101\r\n\
        t=0 0\r\n\
        m=audio 49172 RTP/AVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn test_parse_valid_sdp() {
        let sdp = parse(OFFER.as_bytes()).expect("valid SDP");
        assert!(sdp.connection.is_some());
        assert_eq!(sdp.media_descriptions.len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"this is not sdp").is_err());
    }

    #[test]
    fn test_direction_defaults_to_sendrecv() {
        assert_eq!(direction_of(OFFER), MediaDirection::SendRecv);
    }

    #[test]
    fn test_with_direction_round_trip() {
        let held = with_direction(OFFER, MediaDirection::SendOnly);
        assert_eq!(direction_of(&held), MediaDirection::SendOnly);
        // rtpmap attribute survives the rewrite
        assert!(held.contains("a=rtpmap:0 PCMU/8000"));
        // and the result still parses
        assert!(parse(held.as_bytes()).is_ok());

        let resumed = with_direction(&held, MediaDirection::SendRecv);
        assert_eq!(direction_of(&resumed), MediaDirection::SendRecv);
    }

    #[test]
    fn test_media_level_overrides_session_level() {
        let text = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\na=sendonly\r\nt=0 0\r\n\
            m=audio 4000 RTP/AVP 0\r\na=recvonly\r\n";
        assert_eq!(direction_of(text), MediaDirection::RecvOnly);
    }

    #[test]
    fn test_hold_and_answer_mappings() {
        assert_eq!(MediaDirection::SendRecv.hold(), MediaDirection::SendOnly);
        assert_eq!(MediaDirection::RecvOnly.hold(), MediaDirection::Inactive);
        assert_eq!(MediaDirection::SendOnly.answer(), MediaDirection::RecvOnly);
        assert_eq!(MediaDirection::Inactive.answer(), MediaDirection::Inactive);
        assert!(MediaDirection::SendOnly.is_hold());
        assert!(!MediaDirection::SendRecv.is_hold());
    }
}
