//! Certificate store and crypto contract for S/MIME bodies and RFC 4474
//! identity headers.
//!
//! The stack consumes this interface; the actual signing, encryption,
//! and verification are supplied by a [`SecurityBackend`]
//! implementation backed by whatever crypto library the deployment
//! prefers. The store itself handles PEM/DER bookkeeping and the
//! on-disk layout shared with other SIP tooling.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsip::prelude::{HeadersExt, UntypedHeader};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};
use tracing::{info, warn};

/// The five kinds of PEM material the store manages. The variant name
/// doubles as the file-name prefix: `<prefix>_<name>.pem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PemType {
    Root,
    DomainCert,
    DomainKey,
    UserCert,
    UserKey,
}

impl PemType {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            PemType::Root => "root",
            PemType::DomainCert => "domain_cert",
            PemType::DomainKey => "domain_key",
            PemType::UserCert => "user_cert",
            PemType::UserKey => "user_key",
        }
    }

    pub fn file_name(&self, name: &str) -> String {
        format!("{}_{}.pem", self.file_prefix(), name)
    }
}

/// Outcome of a signature check over a multipart/signed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// no signature processing happened
    None,
    NotSigned,
    /// well-formed and mathematically valid
    Valid,
    Invalid,
    /// valid and chained to a trusted root
    Trusted,
    CaUntrusted,
}

pub struct SignatureCheck {
    pub original: Vec<u8>,
    pub signed_by: Option<String>,
    pub status: SignatureStatus,
}

/// Crypto operations the stack delegates. All failures map to
/// [`Error::SecurityError`]; inbound messages failing a check are
/// dropped, outbound sends fail.
pub trait SecurityBackend: Send + Sync {
    /// Detached signature over `body`, returned as a multipart/signed
    /// payload.
    fn sign(&self, sender_aor: &str, body: &[u8]) -> Result<Vec<u8>>;

    /// PKCS#7 envelope for the recipient's certificate.
    fn encrypt(&self, body: &[u8], recipient: &str) -> Result<Vec<u8>>;

    fn decrypt(&self, decryptor_aor: &str, body: &[u8]) -> Result<Vec<u8>>;

    fn check_signature(&self, body: &[u8]) -> Result<SignatureCheck>;

    /// RFC 4474: sign the canonical identity string with the domain
    /// key. The result is base64 for the Identity header.
    fn compute_identity(&self, signer_domain: &str, canonical: &str) -> Result<String>;

    fn check_identity(&self, signer_domain: &str, canonical: &str, signature: &str)
        -> Result<bool>;
}

const PEM_CERT_HEADER: &str = "-----BEGIN CERTIFICATE-----";
const PEM_CERT_FOOTER: &str = "-----END CERTIFICATE-----";

/// In-memory certificate and key store with optional write-through to a
/// PEM directory (`~/.sipCerts/` by convention on Unix,
/// `C:\sipCerts\` on Windows).
pub struct CertificateStore {
    path: Option<PathBuf>,
    root_certs: RwLock<Vec<Vec<u8>>>,
    entries: RwLock<HashMap<(PemType, String), Vec<u8>>>,
}

impl CertificateStore {
    pub fn in_memory() -> Self {
        CertificateStore {
            path: None,
            root_certs: RwLock::new(Vec::new()),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_directory(path: impl AsRef<Path>) -> Self {
        CertificateStore {
            path: Some(path.as_ref().to_path_buf()),
            root_certs: RwLock::new(Vec::new()),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_directory() -> PathBuf {
        #[cfg(windows)]
        {
            PathBuf::from("C:\\sipCerts\\")
        }
        #[cfg(not(windows))]
        {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".sipCerts"))
                .unwrap_or_else(|_| PathBuf::from(".sipCerts"))
        }
    }

    /// Load everything matching the naming convention from the store
    /// directory.
    pub fn preload(&self) -> Result<()> {
        let Some(dir) = &self.path else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".pem") else {
                continue;
            };
            let parsed = [
                PemType::DomainCert,
                PemType::DomainKey,
                PemType::UserCert,
                PemType::UserKey,
                PemType::Root,
            ]
            .into_iter()
            .find_map(|t| {
                stem.strip_prefix(&format!("{}_", t.file_prefix()))
                    .map(|rest| (t, rest.to_string()))
            });
            let Some((pem_type, key)) = parsed else {
                continue;
            };
            let data = std::fs::read(entry.path())?;
            match pem_type {
                PemType::Root => self.root_certs.write().unwrap().push(data),
                _ => {
                    self.entries
                        .write()
                        .unwrap()
                        .insert((pem_type, key.clone()), data);
                }
            }
            info!("loaded {} {}", pem_type.file_prefix(), key);
        }
        Ok(())
    }

    fn persist(&self, pem_type: PemType, name: &str, data: &[u8]) {
        let Some(dir) = &self.path else { return };
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("cannot create cert directory {}: {}", dir.display(), e);
            return;
        }
        let file = dir.join(pem_type.file_name(name));
        if let Err(e) = std::fs::write(&file, data) {
            warn!("cannot persist {}: {}", file.display(), e);
        }
    }

    fn unpersist(&self, pem_type: PemType, name: &str) {
        if let Some(dir) = &self.path {
            std::fs::remove_file(dir.join(pem_type.file_name(name))).ok();
        }
    }

    pub fn add_root_cert_pem(&self, pem: &[u8]) {
        self.persist(PemType::Root, "ca", pem);
        self.root_certs.write().unwrap().push(pem.to_vec());
    }

    pub fn root_cert_count(&self) -> usize {
        self.root_certs.read().unwrap().len()
    }

    pub fn add_pem(&self, pem_type: PemType, name: &str, pem: &[u8]) {
        self.persist(pem_type, name, pem);
        self.entries
            .write()
            .unwrap()
            .insert((pem_type, name.to_string()), pem.to_vec());
    }

    /// DER entry points wrap/unwrap the base64 PEM armor.
    pub fn add_der(&self, pem_type: PemType, name: &str, der: &[u8]) {
        let pem = der_to_pem(der);
        self.add_pem(pem_type, name, pem.as_bytes());
    }

    pub fn has(&self, pem_type: PemType, name: &str) -> bool {
        self.entries
            .read()
            .unwrap()
            .contains_key(&(pem_type, name.to_string()))
    }

    pub fn get_pem(&self, pem_type: PemType, name: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .unwrap()
            .get(&(pem_type, name.to_string()))
            .cloned()
    }

    pub fn get_der(&self, pem_type: PemType, name: &str) -> Result<Vec<u8>> {
        let pem = self.get_pem(pem_type, name).ok_or_else(|| {
            Error::SecurityError("get", format!("no {} for {}", pem_type.file_prefix(), name))
        })?;
        pem_to_der(&pem)
    }

    pub fn remove(&self, pem_type: PemType, name: &str) -> bool {
        self.unpersist(pem_type, name);
        self.entries
            .write()
            .unwrap()
            .remove(&(pem_type, name.to_string()))
            .is_some()
    }
}

pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut out = String::with_capacity(encoded.len() + 64);
    out.push_str(PEM_CERT_HEADER);
    out.push('\n');
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(PEM_CERT_FOOTER);
    out.push('\n');
    out
}

pub fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(pem)
        .map_err(|e| Error::SecurityError("decode", format!("PEM is not utf-8: {}", e)))?;
    let body: String = text
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    BASE64
        .decode(body.trim())
        .map_err(|e| Error::SecurityError("decode", format!("bad base64 in PEM: {}", e)))
}

/// The canonical string an RFC 4474 identity signature covers:
/// From | To | Call-ID | CSeq | Date | Contact | body, pipe separated.
pub fn identity_canonical_form(msg: &rsip::Request) -> Result<String> {
    let date = msg
        .headers
        .iter()
        .find_map(|h| {
            let line = h.to_string();
            let (k, v) = line.split_once(':')?;
            if k.trim().eq_ignore_ascii_case("Date") {
                Some(v.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_default();
    let contact = msg
        .contact_header()
        .map(|c| c.value().to_string())
        .unwrap_or_default();
    Ok(format!(
        "{}|{}|{}|{}|{}|{}|{}",
        msg.from_header()?.value(),
        msg.to_header()?.value(),
        msg.call_id_header()?.value(),
        msg.cseq_header()?.value(),
        date,
        contact,
        String::from_utf8_lossy(&msg.body),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_file_naming() {
        assert_eq!(PemType::Root.file_name("ca"), "root_ca.pem");
        assert_eq!(
            PemType::DomainCert.file_name("example.com"),
            "domain_cert_example.com.pem"
        );
        assert_eq!(
            PemType::UserKey.file_name("alice@example.com"),
            "user_key_alice@example.com.pem"
        );
    }

    #[test]
    fn test_der_pem_round_trip() {
        let der = b"\x30\x82\x01\x0a\x02\x01\x00".to_vec();
        let pem = der_to_pem(&der);
        assert!(pem.starts_with(PEM_CERT_HEADER));
        let back = pem_to_der(pem.as_bytes()).expect("round trip");
        assert_eq!(back, der);
    }

    #[test]
    fn test_store_add_has_remove() {
        let store = CertificateStore::in_memory();
        assert!(!store.has(PemType::UserCert, "alice@example.com"));
        store.add_der(PemType::UserCert, "alice@example.com", b"certbytes");
        assert!(store.has(PemType::UserCert, "alice@example.com"));
        assert_eq!(
            store
                .get_der(PemType::UserCert, "alice@example.com")
                .expect("stored der"),
            b"certbytes"
        );
        assert!(store.remove(PemType::UserCert, "alice@example.com"));
        assert!(!store.has(PemType::UserCert, "alice@example.com"));
        assert!(store.get_der(PemType::UserCert, "alice@example.com").is_err());
    }

    #[test]
    fn test_identity_canonical_form() {
        use rsip::headers::*;
        let req = rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new("SIP/2.0/UDP a.example.com;branch=z9hG4bK776asdhds").into(),
                From::new("Alice <sip:alice@example.com>;tag=9fxced76sl").into(),
                To::new("Bob <sip:bob@example.com>").into(),
                CallId::new("3848276298220188511@example.com").into(),
                CSeq::new("1 INVITE").into(),
                Contact::new("<sip:alice@a.example.com>").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: b"v=0".to_vec(),
        };
        let canonical = identity_canonical_form(&req).expect("canonical form");
        assert!(canonical.contains("alice@example.com"));
        assert!(canonical.ends_with("v=0"));
        assert_eq!(canonical.matches('|').count(), 6);
    }
}
