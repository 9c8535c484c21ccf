//! Small helpers over `rsip` types that the stack needs in several places.

use crate::Result;

pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

/// Pull the URI out of a Contact line, with or without angle brackets.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    let inner = match (line.find('<'), line.find('>')) {
        (Some(start), Some(end)) if end > start => &line[start + 1..end],
        _ => line.split(';').next().unwrap_or(line).trim(),
    };
    rsip::Uri::try_from(inner).map_err(Into::into)
}

/// True when the named header carries `token` in its comma separated list.
///
/// Used for Supported/Require option tags such as `100rel`.
pub fn header_contains_token(headers: &rsip::Headers, name: &str, token: &str) -> bool {
    headers.iter().any(|h| {
        let line = h.to_string();
        match line.split_once(':') {
            Some((k, v)) => {
                k.trim().eq_ignore_ascii_case(name)
                    && v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
            }
            None => false,
        }
    })
}

pub fn parse_rseq_header(headers: &rsip::Headers) -> Option<u32> {
    headers.iter().find_map(|h| {
        let line = h.to_string();
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case("RSeq") {
            v.trim().parse::<u32>().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_front() {
        let mut headers: rsip::Headers = vec![
            rsip::Header::Via("SIP/2.0/UDP a.example.com".into()),
            rsip::Header::Via("SIP/2.0/UDP b.example.com".into()),
        ]
        .into();
        headers.push_front(rsip::Header::Via("SIP/2.0/TCP c.example.com".into()));
        assert_eq!(headers.iter().count(), 3);
        assert_eq!(
            headers.iter().next(),
            Some(&rsip::Header::Via("SIP/2.0/TCP c.example.com".into()))
        );
    }

    #[test]
    fn test_extract_uri_from_contact() {
        let uri = extract_uri_from_contact("<sip:bob@example.com;transport=tcp>;expires=3600")
            .expect("contact with brackets");
        assert_eq!(uri.host_with_port.to_string(), "example.com");

        let uri = extract_uri_from_contact("sip:alice@example.org").expect("bare contact");
        assert_eq!(uri.host_with_port.to_string(), "example.org");
    }

    #[test]
    fn test_header_contains_token() {
        let headers: rsip::Headers = vec![rsip::Header::Other(
            "Require".into(),
            "timer, 100rel".into(),
        )]
        .into();
        assert!(header_contains_token(&headers, "Require", "100rel"));
        assert!(!header_contains_token(&headers, "Supported", "100rel"));
    }

    #[test]
    fn test_parse_rseq() {
        let headers: rsip::Headers = vec![rsip::Header::Other("RSeq".into(), "314".into())].into();
        assert_eq!(parse_rseq_header(&headers), Some(314));
    }
}
