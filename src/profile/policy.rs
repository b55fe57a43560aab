//! Profile policies.
//!
//! A policy pairs a default, which fills in certificate content, with a
//! constraint, which checks it. The engine runs all defaults of a profile
//! before any of its constraints.

use std::str::FromStr;
use chrono::{Duration, Utc};
use openssl::asn1::Asn1Object;
use regex::Regex;
use serde::Deserialize;
use super::certinfo::{KeyAlgorithm, KeyUsage, RawExtension, Validity};
use super::request::Request;
use crate::commons::{Error, PkiEmptyResult, PkiResult};


//------------ PolicyDefault -------------------------------------------------

/// Fills in part of the certificate info.
pub trait PolicyDefault: Send + Sync {
    fn name(&self) -> &str;

    fn populate(&self, req: &mut Request) -> PkiEmptyResult;
}


//------------ PolicyConstraint ----------------------------------------------

/// Checks the certificate info, returning a constraint violation if needed.
pub trait PolicyConstraint: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, req: &Request) -> PkiEmptyResult;
}


//------------ Policy --------------------------------------------------------

pub struct Policy {
    pub default: Box<dyn PolicyDefault>,
    pub constraint: Box<dyn PolicyConstraint>,
}

impl Policy {
    pub fn new(
        default: impl PolicyDefault + 'static,
        constraint: impl PolicyConstraint + 'static,
    ) -> Self {
        Policy {
            default: Box::new(default),
            constraint: Box::new(constraint),
        }
    }
}


//------------ PolicyConf ----------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct PolicyConf {
    #[serde(default)]
    pub default: DefaultConf,

    #[serde(default)]
    pub constraint: ConstraintConf,
}

impl PolicyConf {
    pub fn build(&self) -> PkiResult<Policy> {
        Ok(Policy {
            default: self.default.build()?,
            constraint: self.constraint.build()?,
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DefaultConf {
    #[default]
    None,
    SubjectName {
        pattern: String,
    },
    Validity {
        range_days: i64,
        #[serde(default)]
        start_offset_secs: i64,
    },
    KeyUsage {
        usages: Vec<KeyUsage>,
    },
    Extension {
        oid: String,
        #[serde(default)]
        critical: bool,
        /// The DER encoded extension value in hex.
        value: String,
    },
}

impl DefaultConf {
    pub fn build(&self) -> PkiResult<Box<dyn PolicyDefault>> {
        Ok(match self {
            DefaultConf::None => Box::new(NoDefault),
            DefaultConf::SubjectName { pattern } => {
                Box::new(SubjectNameDefault::new(pattern))
            }
            DefaultConf::Validity { range_days, start_offset_secs } => {
                Box::new(ValidityDefault::new(*range_days, *start_offset_secs)?)
            }
            DefaultConf::KeyUsage { usages } => {
                Box::new(KeyUsageDefault::new(usages.iter().copied()))
            }
            DefaultConf::Extension { oid, critical, value } => {
                Box::new(ExtensionDefault::from_hex(oid, *critical, value)?)
            }
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintConf {
    #[default]
    None,
    SubjectName {
        pattern: String,
    },
    Validity {
        max_days: i64,
    },
    Key {
        #[serde(default)]
        algorithms: Vec<KeyAlgorithm>,
        #[serde(default)]
        min_rsa_size: Option<u32>,
        #[serde(default)]
        min_ec_size: Option<u32>,
    },
    KeyUsage {
        required: Vec<KeyUsage>,
    },
}

impl ConstraintConf {
    pub fn build(&self) -> PkiResult<Box<dyn PolicyConstraint>> {
        Ok(match self {
            ConstraintConf::None => Box::new(NoConstraint),
            ConstraintConf::SubjectName { pattern } => {
                Box::new(SubjectNameConstraint::new(pattern)?)
            }
            ConstraintConf::Validity { max_days } => {
                Box::new(ValidityConstraint::new(*max_days)?)
            }
            ConstraintConf::Key { algorithms, min_rsa_size, min_ec_size } => {
                Box::new(KeyConstraint {
                    algorithms: algorithms.clone(),
                    min_rsa_size: *min_rsa_size,
                    min_ec_size: *min_ec_size,
                })
            }
            ConstraintConf::KeyUsage { required } => {
                Box::new(KeyUsageConstraint { required: required.clone() })
            }
        })
    }
}


//------------ NoDefault -----------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct NoDefault;

impl PolicyDefault for NoDefault {
    fn name(&self) -> &str {
        "none"
    }

    fn populate(&self, _req: &mut Request) -> PkiEmptyResult {
        Ok(())
    }
}


//------------ SubjectNameDefault --------------------------------------------

/// Sets the subject from a pattern.
///
/// Each `$request.<name>$` in the pattern is replaced by the request value
/// of that name.
#[derive(Clone, Debug)]
pub struct SubjectNameDefault {
    pattern: String,
}

impl SubjectNameDefault {
    pub fn new(pattern: &str) -> Self {
        SubjectNameDefault { pattern: pattern.into() }
    }

    fn substitute(&self, req: &Request) -> PkiResult<String> {
        const PREFIX: &str = "$request.";

        let mut res = String::new();
        let mut rest = self.pattern.as_str();
        while let Some(start) = rest.find(PREFIX) {
            res.push_str(&rest[..start]);
            let after = &rest[start + PREFIX.len()..];
            let end = after.find('$').ok_or_else(|| {
                Error::custom(format!(
                    "Unterminated variable in subject pattern '{}'",
                    self.pattern
                ))
            })?;
            let name = &after[..end];
            let value = req.ext().get_string(name).ok_or_else(|| {
                Error::InputMissing(name.into())
            })?;
            res.push_str(value);
            rest = &after[end + 1..];
        }
        res.push_str(rest);
        Ok(res)
    }
}

impl PolicyDefault for SubjectNameDefault {
    fn name(&self) -> &str {
        "subject_name"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        let subject = self.substitute(req)?;
        req.ext_mut().cert_info_mut().set_subject(subject);
        Ok(())
    }
}


//------------ ValidityDefault -----------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct ValidityDefault {
    range: Duration,
    start_offset: Duration,
}

impl ValidityDefault {
    pub fn new(range_days: i64, start_offset_secs: i64) -> PkiResult<Self> {
        if range_days <= 0 {
            return Err(Error::custom("validity range_days must be positive"))
        }
        let range = Duration::try_days(range_days).ok_or_else(|| {
            Error::custom(format!("validity range_days {range_days} is out of range"))
        })?;
        let start_offset = Duration::try_seconds(start_offset_secs).ok_or_else(|| {
            Error::custom(format!(
                "validity start_offset_secs {start_offset_secs} is out of range"
            ))
        })?;
        Ok(ValidityDefault { range, start_offset })
    }
}

impl PolicyDefault for ValidityDefault {
    fn name(&self) -> &str {
        "validity"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        let start = Utc::now().checked_add_signed(self.start_offset);
        let end = start.and_then(|start| start.checked_add_signed(self.range));
        let (Some(start), Some(end)) = (start, end) else {
            return Err(Error::custom(
                "validity period does not fit into a certificate"
            ))
        };
        req.ext_mut().cert_info_mut().set_validity(Validity::new(start, end));
        Ok(())
    }
}


//------------ KeyUsageDefault -----------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyUsageDefault {
    usages: Vec<KeyUsage>,
}

impl KeyUsageDefault {
    pub fn new(usages: impl IntoIterator<Item = KeyUsage>) -> Self {
        KeyUsageDefault { usages: usages.into_iter().collect() }
    }
}

impl PolicyDefault for KeyUsageDefault {
    fn name(&self) -> &str {
        "key_usage"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        let info = req.ext_mut().cert_info_mut();
        for usage in &self.usages {
            info.add_key_usage(*usage);
        }
        Ok(())
    }
}


//------------ ExtensionDefault ----------------------------------------------

/// Adds a fixed extension.
#[derive(Clone, Debug)]
pub struct ExtensionDefault {
    extension: RawExtension,
}

impl ExtensionDefault {
    pub fn from_hex(oid: &str, critical: bool, value: &str) -> PkiResult<Self> {
        Asn1Object::from_str(oid).map_err(|_| {
            Error::custom(format!("Invalid extension OID '{oid}'"))
        })?;
        let value = hex::decode(value).map_err(|e| {
            Error::custom(format!("Invalid value for extension {oid}: {e}"))
        })?;
        Ok(ExtensionDefault {
            extension: RawExtension { oid: oid.into(), critical, value }
        })
    }
}

impl PolicyDefault for ExtensionDefault {
    fn name(&self) -> &str {
        "extension"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        req.ext_mut().cert_info_mut().add_extension(self.extension.clone());
        Ok(())
    }
}


//------------ NoConstraint --------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct NoConstraint;

impl PolicyConstraint for NoConstraint {
    fn name(&self) -> &str {
        "none"
    }

    fn validate(&self, _req: &Request) -> PkiEmptyResult {
        Ok(())
    }
}


//------------ SubjectNameConstraint -----------------------------------------

/// Requires the whole subject to match a regular expression.
#[derive(Clone, Debug)]
pub struct SubjectNameConstraint {
    pattern: Regex,
}

impl SubjectNameConstraint {
    pub fn new(pattern: &str) -> PkiResult<Self> {
        let pattern = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            Error::custom(format!("Invalid subject pattern '{pattern}': {e}"))
        })?;
        Ok(SubjectNameConstraint { pattern })
    }
}

impl PolicyConstraint for SubjectNameConstraint {
    fn name(&self) -> &str {
        "subject_name"
    }

    fn validate(&self, req: &Request) -> PkiEmptyResult {
        let subject = req.ext().cert_info().and_then(|info| {
            info.subject()
        }).ok_or_else(|| Error::constraint("no subject name"))?;
        if self.pattern.is_match(subject) {
            Ok(())
        }
        else {
            Err(Error::constraint(format!(
                "subject name '{subject}' not allowed"
            )))
        }
    }
}


//------------ ValidityConstraint --------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct ValidityConstraint {
    max_days: i64,
    max: Duration,
}

impl ValidityConstraint {
    pub fn new(max_days: i64) -> PkiResult<Self> {
        if max_days <= 0 {
            return Err(Error::custom("validity max_days must be positive"))
        }
        let max = Duration::try_days(max_days).ok_or_else(|| {
            Error::custom(format!("validity max_days {max_days} is out of range"))
        })?;
        Ok(ValidityConstraint { max_days, max })
    }
}

impl PolicyConstraint for ValidityConstraint {
    fn name(&self) -> &str {
        "validity"
    }

    fn validate(&self, req: &Request) -> PkiEmptyResult {
        let validity = req.ext().cert_info().and_then(|info| {
            info.validity()
        }).ok_or_else(|| Error::constraint("no validity"))?;
        if validity.not_after() <= validity.not_before() {
            return Err(Error::constraint("validity ends before it starts"))
        }
        if validity.duration() > self.max {
            return Err(Error::constraint(format!(
                "validity exceeds {} days", self.max_days
            )))
        }
        Ok(())
    }
}


//------------ KeyConstraint -------------------------------------------------

/// Restricts key algorithms and sizes.
///
/// A server-side keygen placeholder passes. The generated key comes from
/// the KRA.
#[derive(Clone, Debug)]
pub struct KeyConstraint {
    algorithms: Vec<KeyAlgorithm>,
    min_rsa_size: Option<u32>,
    min_ec_size: Option<u32>,
}

impl PolicyConstraint for KeyConstraint {
    fn name(&self) -> &str {
        "key"
    }

    fn validate(&self, req: &Request) -> PkiEmptyResult {
        let key = req.ext().cert_info().and_then(|info| {
            info.key()
        }).ok_or_else(|| Error::constraint("no public key"))?;
        if key.is_placeholder() {
            return Ok(())
        }
        let (alg, bits) = key.algorithm()?;
        if !self.algorithms.is_empty() && !self.algorithms.contains(&alg) {
            return Err(Error::constraint(format!(
                "key algorithm {alg} not allowed"
            )))
        }
        let min = match alg {
            KeyAlgorithm::Rsa => self.min_rsa_size,
            KeyAlgorithm::Ec => self.min_ec_size,
            KeyAlgorithm::Ed25519 => None,
        };
        if let Some(min) = min {
            if bits < min {
                return Err(Error::constraint(format!(
                    "{alg} key of {bits} bits is below the minimum of {min}"
                )))
            }
        }
        Ok(())
    }
}


//------------ KeyUsageConstraint --------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyUsageConstraint {
    required: Vec<KeyUsage>,
}

impl PolicyConstraint for KeyUsageConstraint {
    fn name(&self) -> &str {
        "key_usage"
    }

    fn validate(&self, req: &Request) -> PkiEmptyResult {
        let info = req.ext().cert_info().ok_or_else(|| {
            Error::constraint("no key usage")
        })?;
        match self.required.iter().find(|usage| {
            !info.key_usage().contains(*usage)
        }) {
            Some(missing) => Err(Error::constraint(format!(
                "key usage {missing} is required"
            ))),
            None => Ok(()),
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::certinfo::SubjectKey;
    use crate::profile::request::RequestType;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    #[test]
    fn subject_pattern_substitution() {
        let mut req = Request::new(RequestType::Enrollment)
            .with_input("uid", "jdoe")
            .with_input("org", "Example");
        let default = SubjectNameDefault::new("UID=$request.uid$,O=$request.org$");
        default.populate(&mut req).unwrap();
        assert_eq!(
            req.ext().cert_info().unwrap().subject(),
            Some("UID=jdoe,O=Example")
        );

        let missing = SubjectNameDefault::new("CN=$request.cn$");
        assert!(matches!(
            missing.populate(&mut req), Err(Error::InputMissing(_))
        ));
    }

    #[test]
    fn validity_default_and_constraint() {
        let mut req = Request::new(RequestType::Enrollment);
        ValidityDefault::new(30, -60).unwrap().populate(&mut req).unwrap();
        assert!(ValidityConstraint::new(31).unwrap().validate(&req).is_ok());
        assert!(ValidityConstraint::new(7).unwrap().validate(&req).is_err());
        assert!(ValidityDefault::new(0, 0).is_err());
    }

    #[test]
    fn oversized_validity_is_an_error() {
        assert!(ValidityDefault::new(i64::MAX, 0).is_err());
        assert!(ValidityDefault::new(1, i64::MAX).is_err());
        assert!(ValidityConstraint::new(i64::MAX).is_err());
        assert!(ValidityConstraint::new(0).is_err());

        let conf = ConstraintConf::Validity { max_days: i64::MAX };
        assert!(conf.build().is_err());

        // Representable as a duration, but not as an end date.
        let default = DefaultConf::Validity {
            range_days: 1_000_000_000, start_offset_secs: 0
        }.build().unwrap();
        let mut req = Request::new(RequestType::Enrollment);
        assert!(default.populate(&mut req).is_err());
        assert!(req.ext().cert_info().and_then(|i| i.validity()).is_none());
    }

    #[test]
    fn subject_constraint_matches_whole_subject() {
        let mut req = Request::new(RequestType::Enrollment);
        req.ext_mut().cert_info_mut().set_subject("CN=alice,O=Example");
        let constraint = SubjectNameConstraint::new("CN=[a-z]+,O=Example").unwrap();
        assert!(constraint.validate(&req).is_ok());
        let constraint = SubjectNameConstraint::new("CN=[a-z]+").unwrap();
        assert!(matches!(
            constraint.validate(&req), Err(Error::ConstraintViolation(_))
        ));
    }

    #[test]
    fn key_constraint() {
        let mut req = Request::new(RequestType::Enrollment);
        let constraint = KeyConstraint {
            algorithms: vec![KeyAlgorithm::Rsa],
            min_rsa_size: Some(2048),
            min_ec_size: None,
        };
        assert!(constraint.validate(&req).is_err());

        req.ext_mut().cert_info_mut().set_key(SubjectKey::Placeholder);
        assert!(constraint.validate(&req).is_ok());

        let small = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        req.ext_mut().cert_info_mut().set_key(
            SubjectKey::from_der(small.public_key_to_der().unwrap()).unwrap()
        );
        assert!(constraint.validate(&req).is_err());
    }

    #[test]
    fn key_usage_constraint() {
        let mut req = Request::new(RequestType::Enrollment);
        KeyUsageDefault::new([KeyUsage::DigitalSignature]).populate(&mut req).unwrap();
        let constraint = KeyUsageConstraint {
            required: vec![KeyUsage::DigitalSignature, KeyUsage::NonRepudiation],
        };
        assert!(constraint.validate(&req).is_err());
        KeyUsageDefault::new([KeyUsage::NonRepudiation]).populate(&mut req).unwrap();
        assert!(constraint.validate(&req).is_ok());
    }

    #[test]
    fn extension_default_checks_input() {
        assert!(ExtensionDefault::from_hex("1.2.3.4", false, "0500").is_ok());
        assert!(ExtensionDefault::from_hex("not an oid", false, "0500").is_err());
        assert!(ExtensionDefault::from_hex("1.2.3.4", false, "zz").is_err());
    }
}
