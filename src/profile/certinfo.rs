//! The data a certificate is built from.

use std::collections::BTreeSet;
use std::{fmt, str};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{Id, PKey, Public};
use serde::Deserialize;
use crate::commons::{Error, PkiResult};


//------------ SubjectKey ----------------------------------------------------

/// The public key of a certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubjectKey {
    /// Stands in for a key the KRA has yet to generate.
    Placeholder,

    /// A DER encoded SubjectPublicKeyInfo.
    Der(Vec<u8>),
}

impl SubjectKey {
    /// Decodes and checks a base64 encoded SubjectPublicKeyInfo.
    pub fn from_base64(s: &str) -> PkiResult<Self> {
        let der = BASE64.decode(s.trim()).map_err(|e| {
            Error::InvalidPublicKey(e.to_string())
        })?;
        Self::from_der(der)
    }

    /// Checks and wraps a DER encoded SubjectPublicKeyInfo.
    pub fn from_der(der: Vec<u8>) -> PkiResult<Self> {
        PKey::public_key_from_der(&der).map_err(|e| {
            Error::InvalidPublicKey(e.to_string())
        })?;
        Ok(SubjectKey::Der(der))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, SubjectKey::Placeholder)
    }

    /// Returns the parsed key unless this is a placeholder.
    pub fn to_pkey(&self) -> PkiResult<PKey<Public>> {
        match self {
            SubjectKey::Placeholder => Err(Error::MissingPublicKey),
            SubjectKey::Der(der) => {
                PKey::public_key_from_der(der).map_err(|e| {
                    Error::InvalidPublicKey(e.to_string())
                })
            }
        }
    }

    /// Returns the algorithm and size in bits of the key.
    pub fn algorithm(&self) -> PkiResult<(KeyAlgorithm, u32)> {
        let key = self.to_pkey()?;
        let alg = match key.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::Ec,
            Id::ED25519 => KeyAlgorithm::Ed25519,
            other => {
                return Err(Error::InvalidPublicKey(
                    format!("unsupported key type {}", other.as_raw())
                ))
            }
        };
        Ok((alg, key.bits()))
    }
}


//------------ KeyAlgorithm --------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ec => "EC",
            KeyAlgorithm::Ed25519 => "Ed25519",
        })
    }
}


//------------ KeyUsage ------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd
)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            KeyUsage::DigitalSignature => "digitalSignature",
            KeyUsage::NonRepudiation => "nonRepudiation",
            KeyUsage::KeyEncipherment => "keyEncipherment",
            KeyUsage::DataEncipherment => "dataEncipherment",
            KeyUsage::KeyAgreement => "keyAgreement",
            KeyUsage::KeyCertSign => "keyCertSign",
            KeyUsage::CrlSign => "cRLSign",
            KeyUsage::EncipherOnly => "encipherOnly",
            KeyUsage::DecipherOnly => "decipherOnly",
        })
    }
}


//------------ Validity ------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Validity {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Validity { not_before, not_after }
    }

    /// Creates a validity starting at `start` and lasting `days`.
    ///
    /// Returns `None` if the end is not a representable date.
    pub fn days_from(start: DateTime<Utc>, days: i64) -> Option<Self> {
        let end = start.checked_add_signed(Duration::try_days(days)?)?;
        Some(Validity::new(start, end))
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn duration(&self) -> Duration {
        self.not_after - self.not_before
    }
}


//------------ RawExtension --------------------------------------------------

/// A certificate extension given as OID and DER encoded value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawExtension {
    pub oid: String,
    pub critical: bool,
    pub value: Vec<u8>,
}


//------------ CertificateInfo -----------------------------------------------

/// The content of a certificate to be issued.
///
/// Profile stages build this up piece by piece. Issuance requires a subject,
/// a validity and a real public key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CertificateInfo {
    subject: Option<String>,
    key: Option<SubjectKey>,
    validity: Option<Validity>,
    key_usage: BTreeSet<KeyUsage>,
    extensions: Vec<RawExtension>,
}

impl CertificateInfo {
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.subject = Some(subject.into())
    }

    pub fn key(&self) -> Option<&SubjectKey> {
        self.key.as_ref()
    }

    pub fn set_key(&mut self, key: SubjectKey) {
        self.key = Some(key)
    }

    pub fn delete_key(&mut self) -> Option<SubjectKey> {
        self.key.take()
    }

    pub fn has_placeholder_key(&self) -> bool {
        self.key.as_ref().is_some_and(SubjectKey::is_placeholder)
    }

    /// Installs a real key, dropping a placeholder first.
    ///
    /// Returns whether a placeholder was removed.
    pub fn replace_placeholder_key(&mut self, key: SubjectKey) -> bool {
        let removed = if self.has_placeholder_key() {
            self.delete_key();
            true
        }
        else {
            false
        };
        self.set_key(key);
        removed
    }

    /// Returns the key if it is present and real.
    pub fn usable_key(&self) -> PkiResult<&SubjectKey> {
        match self.key.as_ref() {
            Some(key) if !key.is_placeholder() => Ok(key),
            _ => Err(Error::MissingPublicKey),
        }
    }

    pub fn validity(&self) -> Option<&Validity> {
        self.validity.as_ref()
    }

    pub fn set_validity(&mut self, validity: Validity) {
        self.validity = Some(validity)
    }

    pub fn key_usage(&self) -> &BTreeSet<KeyUsage> {
        &self.key_usage
    }

    pub fn add_key_usage(&mut self, usage: KeyUsage) {
        self.key_usage.insert(usage);
    }

    /// Returns whether the key usage marks this as an encryption cert.
    pub fn is_encryption_cert(&self) -> bool {
        self.key_usage.contains(&KeyUsage::KeyEncipherment)
            || self.key_usage.contains(&KeyUsage::DataEncipherment)
    }

    pub fn extensions(&self) -> &[RawExtension] {
        &self.extensions
    }

    /// Adds an extension, replacing one with the same OID.
    pub fn add_extension(&mut self, ext: RawExtension) {
        self.extensions.retain(|item| item.oid != ext.oid);
        self.extensions.push(ext);
    }

    /// Returns the common name of the subject, or else the whole subject.
    pub fn client_id(&self) -> Option<&str> {
        let subject = self.subject()?;
        Some(dn_attribute(subject, "CN").unwrap_or(subject))
    }
}


//------------ DN helpers ----------------------------------------------------

/// Splits a string DN into its attribute/value pairs.
///
/// Commas escaped with a backslash do not separate components. Values are
/// returned as written, including the escapes.
pub fn dn_components(dn: &str) -> Vec<(&str, &str)> {
    let mut res = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let bytes = dn.as_bytes();
    for (idx, &ch) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue
        }
        match ch {
            b'\\' => escaped = true,
            b',' => {
                push_component(&dn[start..idx], &mut res);
                start = idx + 1;
            }
            _ => { }
        }
    }
    push_component(&dn[start..], &mut res);
    res
}

fn push_component<'a>(rdn: &'a str, res: &mut Vec<(&'a str, &'a str)>) {
    if let Some((attr, value)) = rdn.split_once('=') {
        res.push((attr.trim(), value.trim()));
    }
}

/// Returns the value of the first occurrence of an attribute in a DN.
pub fn dn_attribute<'a>(dn: &'a str, attr: &str) -> Option<&'a str> {
    dn_components(dn).into_iter().find(|(name, _)| {
        name.eq_ignore_ascii_case(attr)
    }).map(|(_, value)| value)
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;

    fn rsa_key_der() -> Vec<u8> {
        let rsa = Rsa::generate(2048).unwrap();
        PKey::from_rsa(rsa).unwrap().public_key_to_der().unwrap()
    }

    #[test]
    fn placeholder_is_replaced() {
        let mut info = CertificateInfo::default();
        info.set_key(SubjectKey::Placeholder);
        assert!(info.usable_key().is_err());

        let key = SubjectKey::from_der(rsa_key_der()).unwrap();
        assert!(info.replace_placeholder_key(key.clone()));
        assert!(!info.has_placeholder_key());
        assert_eq!(info.usable_key().unwrap(), &key);
        assert!(!info.replace_placeholder_key(key));
    }

    #[test]
    fn key_from_base64() {
        let der = rsa_key_der();
        let key = SubjectKey::from_base64(&BASE64.encode(&der)).unwrap();
        assert_eq!(key.algorithm().unwrap(), (KeyAlgorithm::Rsa, 2048));
        assert!(SubjectKey::from_base64("not base64!").is_err());
        assert!(SubjectKey::from_base64(&BASE64.encode(b"garbage")).is_err());
    }

    #[test]
    fn encryption_cert_from_key_usage() {
        let mut info = CertificateInfo::default();
        info.add_key_usage(KeyUsage::DigitalSignature);
        assert!(!info.is_encryption_cert());
        info.add_key_usage(KeyUsage::DataEncipherment);
        assert!(info.is_encryption_cert());
    }

    #[test]
    fn client_id_prefers_common_name() {
        let mut info = CertificateInfo::default();
        assert_eq!(info.client_id(), None);
        info.set_subject("UID=jdoe, CN=John Doe, O=Example");
        assert_eq!(info.client_id(), Some("John Doe"));
        info.set_subject("UID=jdoe,O=Example");
        assert_eq!(info.client_id(), Some("UID=jdoe,O=Example"));
    }

    #[test]
    fn dn_escaped_commas() {
        let parts = dn_components(r"CN=Doe\, John,O=Example");
        assert_eq!(parts, [("CN", r"Doe\, John"), ("O", "Example")]);
    }
}
