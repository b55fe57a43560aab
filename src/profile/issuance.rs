//! Issuing certificates.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use log::{debug, info};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, KeyUsage as X509KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509Extension, X509Name, X509NameRef};
use serde::Deserialize;
use super::certinfo::{CertificateInfo, KeyUsage, dn_components};
use super::request::RequestId;
use crate::commons::{Error, PkiResult};


//------------ Certificate ---------------------------------------------------

/// An issued certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    serial: String,
    subject: String,
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    der: Vec<u8>,
}

impl Certificate {
    /// Returns the serial number as upper case hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> PkiResult<String> {
        let cert = X509::from_der(&self.der)?;
        String::from_utf8(cert.to_pem()?).map_err(Error::signer)
    }

    pub fn to_x509(&self) -> PkiResult<X509> {
        Ok(X509::from_der(&self.der)?)
    }
}


//------------ CaService -----------------------------------------------------

/// Issues certificates on behalf of a certificate authority.
pub trait CaService: Send + Sync {
    fn issue_x509_cert(
        &self,
        authority_id: &str,
        info: &CertificateInfo,
        profile_id: &str,
        request_id: &RequestId,
    ) -> PkiResult<Certificate>;
}


//------------ AuthorityConf -------------------------------------------------

/// An issuing authority as defined in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthorityConf {
    pub id: String,

    /// The PEM file with the authority's certificate.
    pub cert_pem: PathBuf,

    /// The PEM file with the authority's private key.
    pub key_pem: PathBuf,
}


//------------ Authority -----------------------------------------------------

struct Authority {
    cert: X509,
    key: PKey<Private>,
}


//------------ OpenSslIssuer -------------------------------------------------

/// Issues certificates with keys held in memory by OpenSSL.
#[derive(Default)]
pub struct OpenSslIssuer {
    authorities: HashMap<String, Authority>,
}

impl OpenSslIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads all configured authorities from their PEM files.
    pub fn load(confs: &[AuthorityConf]) -> PkiResult<Self> {
        let mut res = Self::new();
        for conf in confs {
            let cert = X509::from_pem(&std::fs::read(&conf.cert_pem)?)?;
            let key = PKey::private_key_from_pem(
                &std::fs::read(&conf.key_pem)?
            )?;
            res.add_authority(&conf.id, cert, key)?;
            info!("Loaded certificate authority '{}'", conf.id);
        }
        Ok(res)
    }

    /// Adds an authority, checking that key and certificate match.
    pub fn add_authority(
        &mut self, id: &str, cert: X509, key: PKey<Private>
    ) -> PkiResult<()> {
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::signer(format!(
                "Key for authority '{id}' does not match its certificate"
            )))
        }
        self.authorities.insert(id.into(), Authority { cert, key });
        Ok(())
    }

    pub fn has_authority(&self, id: &str) -> bool {
        self.authorities.contains_key(id)
    }

    fn build(
        ca: &Authority, info: &CertificateInfo
    ) -> PkiResult<(X509, DateTime<Utc>, DateTime<Utc>)> {
        let subject = info.subject().ok_or_else(|| {
            Error::issuance("certificate info has no subject")
        })?;
        let validity = info.validity().ok_or_else(|| {
            Error::issuance("certificate info has no validity")
        })?;
        let key = info.usable_key()?.to_pkey()?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;

        let subject_name = parse_name(subject)?;
        builder.set_subject_name(&subject_name)?;
        builder.set_issuer_name(ca.cert.subject_name())?;
        builder.set_pubkey(&key)?;

        let not_before = validity.not_before();
        let not_after = validity.not_after();
        builder.set_not_before(
            Asn1Time::from_unix(not_before.timestamp())?.as_ref()
        )?;
        builder.set_not_after(
            Asn1Time::from_unix(not_after.timestamp())?.as_ref()
        )?;

        let ski = SubjectKeyIdentifier::new().build(
            &builder.x509v3_context(Some(&ca.cert), None)
        )?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new().keyid(false).build(
            &builder.x509v3_context(Some(&ca.cert), None)
        )?;
        builder.append_extension(aki)?;

        if !info.key_usage().is_empty() {
            builder.append_extension(key_usage_extension(info)?)?;
        }
        for ext in info.extensions() {
            let oid = Asn1Object::from_str(&ext.oid)?;
            let value = Asn1OctetString::new_from_bytes(&ext.value)?;
            builder.append_extension(
                X509Extension::new_from_der(&oid, ext.critical, &value)?
            )?;
        }

        let digest = match ca.key.id() {
            Id::ED25519 | Id::ED448 => MessageDigest::null(),
            _ => MessageDigest::sha256(),
        };
        builder.sign(&ca.key, digest)?;
        Ok((builder.build(), not_before, not_after))
    }
}

impl CaService for OpenSslIssuer {
    fn issue_x509_cert(
        &self,
        authority_id: &str,
        info: &CertificateInfo,
        profile_id: &str,
        request_id: &RequestId,
    ) -> PkiResult<Certificate> {
        let ca = self.authorities.get(authority_id).ok_or_else(|| {
            Error::AuthorityUnknown(authority_id.into())
        })?;
        let (cert, not_before, not_after) = Self::build(ca, info)?;
        let serial = cert.serial_number().to_bn()?.to_hex_str()?.to_string();
        let res = Certificate {
            serial,
            subject: name_to_string(cert.subject_name()),
            issuer: name_to_string(cert.issuer_name()),
            not_before,
            not_after,
            der: cert.to_der()?,
        };
        info!(
            "Authority '{}' issued certificate {} for request {} (profile {})",
            authority_id, res.serial, request_id, profile_id
        );
        Ok(res)
    }
}

impl fmt::Debug for OpenSslIssuer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpenSslIssuer")
            .field("authorities", &self.authorities.keys())
            .finish()
    }
}


//------------ Helpers -------------------------------------------------------

fn key_usage_extension(info: &CertificateInfo) -> PkiResult<X509Extension> {
    let mut ku = X509KeyUsage::new();
    ku.critical();
    for usage in info.key_usage() {
        match usage {
            KeyUsage::DigitalSignature => ku.digital_signature(),
            KeyUsage::NonRepudiation => ku.non_repudiation(),
            KeyUsage::KeyEncipherment => ku.key_encipherment(),
            KeyUsage::DataEncipherment => ku.data_encipherment(),
            KeyUsage::KeyAgreement => ku.key_agreement(),
            KeyUsage::KeyCertSign => ku.key_cert_sign(),
            KeyUsage::CrlSign => ku.crl_sign(),
            KeyUsage::EncipherOnly => ku.encipher_only(),
            KeyUsage::DecipherOnly => ku.decipher_only(),
        };
    }
    Ok(ku.build()?)
}

/// Converts a string DN into an X.509 name.
fn parse_name(dn: &str) -> PkiResult<X509Name> {
    let mut builder = X509Name::builder()?;
    let components = dn_components(dn);
    if components.is_empty() {
        return Err(Error::invalid_input("subject", format!("invalid DN '{dn}'")))
    }
    for (attr, value) in components {
        let value = value.replace("\\,", ",");
        builder.append_entry_by_text(attr, &value).map_err(|e| {
            Error::invalid_input("subject", format!("'{attr}={value}': {e}"))
        })?;
    }
    Ok(builder.build())
}

/// Formats an X.509 name as a comma separated string DN.
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries().map(|entry| {
        let attr = entry.object().nid().short_name().unwrap_or("?");
        let value = entry.data().as_utf8().map(|s| {
            s.to_string().replace(',', "\\,")
        }).unwrap_or_default();
        format!("{attr}={value}")
    }).collect::<Vec<_>>().join(",")
}

/// Logs details of an issued certificate at debug level.
pub fn log_issued(cert: &Certificate) {
    debug!(
        "Certificate {} subject '{}' issuer '{}' valid {} - {}",
        cert.serial(), cert.subject(), cert.issuer(),
        cert.not_before(), cert.not_after()
    );
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;
    use crate::profile::certinfo::{RawExtension, SubjectKey, Validity};

    fn test_authority() -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let name = parse_name("CN=Test CA,O=Example").unwrap();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(Asn1Time::days_from_now(0).unwrap().as_ref()).unwrap();
        builder.set_not_after(Asn1Time::days_from_now(365).unwrap().as_ref()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }

    fn info() -> CertificateInfo {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut info = CertificateInfo::default();
        info.set_subject("CN=Jane Doe,O=Example");
        info.set_key(SubjectKey::from_der(key.public_key_to_der().unwrap()).unwrap());
        info.set_validity(Validity::days_from(Utc::now(), 30).unwrap());
        info.add_key_usage(KeyUsage::DigitalSignature);
        info.add_key_usage(KeyUsage::KeyEncipherment);
        info
    }

    #[test]
    fn issue_certificate() {
        let (cert, key) = test_authority();
        let mut issuer = OpenSslIssuer::new();
        issuer.add_authority("ca1", cert.clone(), key).unwrap();

        let mut info = info();
        info.add_extension(RawExtension {
            // certificate policies: any policy
            oid: "2.5.29.32".into(),
            critical: false,
            value: vec![
                0x30, 0x08, 0x30, 0x06, 0x06, 0x04, 0x55, 0x1d, 0x20, 0x00
            ],
        });

        let issued = issuer.issue_x509_cert(
            "ca1", &info, "caUserCert", &RequestId::from("1")
        ).unwrap();
        assert_eq!(issued.subject(), "CN=Jane Doe,O=Example");
        assert_eq!(issued.issuer(), "CN=Test CA,O=Example");

        let x509 = issued.to_x509().unwrap();
        assert!(x509.verify(&cert.public_key().unwrap()).unwrap());
        assert!(issued.to_pem().unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn unknown_authority() {
        let issuer = OpenSslIssuer::new();
        let err = issuer.issue_x509_cert(
            "nope", &info(), "p", &RequestId::from("1")
        ).unwrap_err();
        assert!(matches!(err, Error::AuthorityUnknown(_)));
    }

    #[test]
    fn refuses_placeholder_key() {
        let (cert, key) = test_authority();
        let mut issuer = OpenSslIssuer::new();
        issuer.add_authority("ca1", cert, key).unwrap();
        let mut info = info();
        info.set_key(SubjectKey::Placeholder);
        let err = issuer.issue_x509_cert(
            "ca1", &info, "p", &RequestId::from("1")
        ).unwrap_err();
        assert!(matches!(err, Error::MissingPublicKey));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let (cert, _) = test_authority();
        let (_, other_key) = test_authority();
        let mut issuer = OpenSslIssuer::new();
        assert!(issuer.add_authority("ca1", cert, other_key).is_err());
    }
}
