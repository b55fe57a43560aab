//! Profile inputs: copying what the client submitted into the request.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use serde::Deserialize;
use super::certinfo::{SubjectKey, dn_components};
use super::request::Request;
use crate::authz::AuthContext;
use crate::commons::{Error, PkiEmptyResult};


/// The submitted subject DN.
pub const INPUT_SUBJECT: &str = "subject";

/// The submitted base64 encoded SubjectPublicKeyInfo.
pub const INPUT_PUBLIC_KEY: &str = "public_key";

/// The submitted base64 encoded PKIArchiveOptions.
pub const INPUT_ARCHIVE_OPTIONS: &str = "pki_archive_options";


//------------ ProfileInput --------------------------------------------------

/// A stage that populates the request from submitted values.
pub trait ProfileInput: Send + Sync {
    fn name(&self) -> &str;

    fn populate(&self, ctx: &AuthContext, req: &mut Request) -> PkiEmptyResult;
}


//------------ InputConf -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputConf {
    SubjectName,
    Key,
    ArchiveOptions,
}

impl InputConf {
    pub fn build(&self) -> Box<dyn ProfileInput> {
        match self {
            InputConf::SubjectName => Box::new(SubjectNameInput),
            InputConf::Key => Box::new(KeyInput),
            InputConf::ArchiveOptions => Box::new(ArchiveOptionsInput),
        }
    }
}


//------------ SubjectNameInput ----------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct SubjectNameInput;

impl ProfileInput for SubjectNameInput {
    fn name(&self) -> &str {
        "subject_name"
    }

    fn populate(&self, _ctx: &AuthContext, req: &mut Request) -> PkiEmptyResult {
        let subject = req.ext().get_string(INPUT_SUBJECT).ok_or_else(|| {
            Error::InputMissing(INPUT_SUBJECT.into())
        })?.trim().to_string();
        if dn_components(&subject).is_empty() {
            return Err(Error::invalid_input(
                INPUT_SUBJECT, format!("'{subject}' is not a DN")
            ))
        }
        req.ext_mut().cert_info_mut().set_subject(subject);
        Ok(())
    }
}


//------------ KeyInput ------------------------------------------------------

/// Reads the submitted public key.
///
/// Requests for server-side keygen carry no key. They get a placeholder
/// which is replaced once the KRA has generated the key.
#[derive(Clone, Copy, Debug)]
pub struct KeyInput;

impl ProfileInput for KeyInput {
    fn name(&self) -> &str {
        "key"
    }

    fn populate(&self, _ctx: &AuthContext, req: &mut Request) -> PkiEmptyResult {
        if req.ext().is_server_side_keygen() {
            debug!("Request {} uses server-side keygen", req.id());
            req.ext_mut().cert_info_mut().set_key(SubjectKey::Placeholder);
            return Ok(())
        }
        if req.ext().cert_info().and_then(|info| info.key()).is_some() {
            return Ok(())
        }
        let key = req.ext().get_string(INPUT_PUBLIC_KEY).ok_or_else(|| {
            Error::InputMissing(INPUT_PUBLIC_KEY.into())
        })?;
        let key = SubjectKey::from_base64(key)?;
        req.ext_mut().cert_info_mut().set_key(key);
        Ok(())
    }
}


//------------ ArchiveOptionsInput -------------------------------------------

/// Reads optional key archival options.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveOptionsInput;

impl ProfileInput for ArchiveOptionsInput {
    fn name(&self) -> &str {
        "archive_options"
    }

    fn populate(&self, _ctx: &AuthContext, req: &mut Request) -> PkiEmptyResult {
        let Some(options) = req.ext().get_string(INPUT_ARCHIVE_OPTIONS) else {
            return Ok(())
        };
        let options = BASE64.decode(options.trim()).map_err(|e| {
            Error::invalid_input(INPUT_ARCHIVE_OPTIONS, e)
        })?;
        if options.is_empty() {
            return Err(Error::invalid_input(INPUT_ARCHIVE_OPTIONS, "empty"))
        }
        req.ext_mut().set_archive_options(options);
        Ok(())
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::request::{RequestType, SensitiveFields};

    #[test]
    fn subject_is_required() {
        let ctx = AuthContext::anonymous();
        let mut req = Request::new(RequestType::Enrollment);
        assert!(matches!(
            SubjectNameInput.populate(&ctx, &mut req),
            Err(Error::InputMissing(_))
        ));

        let mut req = req.with_input(INPUT_SUBJECT, "CN=Alice");
        SubjectNameInput.populate(&ctx, &mut req).unwrap();
        assert_eq!(req.ext().cert_info().unwrap().subject(), Some("CN=Alice"));
    }

    #[test]
    fn keygen_gets_placeholder() {
        let ctx = AuthContext::anonymous();
        let mut req = Request::server_side_keygen(SensitiveFields::default());
        KeyInput.populate(&ctx, &mut req).unwrap();
        assert!(req.ext().cert_info().unwrap().has_placeholder_key());
    }

    #[test]
    fn invalid_key_is_rejected() {
        let ctx = AuthContext::anonymous();
        let mut req = Request::new(RequestType::Enrollment)
            .with_input(INPUT_PUBLIC_KEY, BASE64.encode(b"nope"));
        assert!(matches!(
            KeyInput.populate(&ctx, &mut req),
            Err(Error::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn archive_options_are_optional() {
        let ctx = AuthContext::anonymous();
        let mut req = Request::new(RequestType::Enrollment);
        ArchiveOptionsInput.populate(&ctx, &mut req).unwrap();
        assert!(req.ext().archive_options().is_none());

        let mut req = req.with_input(INPUT_ARCHIVE_OPTIONS, BASE64.encode([1u8, 2]));
        ArchiveOptionsInput.populate(&ctx, &mut req).unwrap();
        assert_eq!(req.ext().archive_options(), Some(&[1u8, 2][..]));
    }
}
