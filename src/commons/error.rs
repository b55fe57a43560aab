//! Defines all server side errors.

use std::{error, fmt, io};
use crate::authz::acl::AclParseError;
use crate::config::ConfigError;
use crate::profile::request::{RequestId, RequestStatus};
use crate::session::directory::DirectoryError;


//------------ ErrorClass ----------------------------------------------------

/// The broad category of an error.
///
/// API layers use this to pick a response: access denial maps to a
/// forbidden response, everything else to the generic rejection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The server or a profile is misconfigured. Never retried.
    Configuration,

    /// A remote service rejected the request.
    RemoteRejection,

    /// The caller is not allowed to do this.
    AccessDenied,

    /// The request is in a terminal state and cannot be processed again.
    Terminal,

    /// Anything else.
    Internal,
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    IoError(io::Error),
    ConfigError(ConfigError),
    SignerError(String),
    DirectoryError(DirectoryError),
    Custom(String),

    //-----------------------------------------------------------------
    // Authorization Issues
    //-----------------------------------------------------------------
    AclParse(AclParseError),
    AuthzManagerNotFound(String),
    AuthzPluginUnknown(String),
    UnknownRealm(String),
    AccessDenied {
        user: Option<String>,
        resource: String,
        operation: String,
    },

    //-----------------------------------------------------------------
    // Profile Issues
    //-----------------------------------------------------------------
    ProfileUnknown(String),
    ProfileNotEnabled(String),
    AuthorityUnknown(String),
    InputMissing(String),
    InputInvalid(String, String),
    ConstraintViolation(String),
    MissingPublicKey,
    InvalidPublicKey(String),
    RequestTerminal(RequestId, RequestStatus),

    /// A profile level failure wrapping its original cause.
    Profile {
        msg: String,
        cause: Option<Box<Error>>,
    },

    //-----------------------------------------------------------------
    // Key Recovery Issues
    //-----------------------------------------------------------------
    KraNotConfigured,
    KraTimeout,
    KraRejected {
        msg: String,
        terminal: bool,
    },

    //-----------------------------------------------------------------
    // Issuance Issues
    //-----------------------------------------------------------------
    IssuanceFailed(String),

    //-----------------------------------------------------------------
    // Session Issues
    //-----------------------------------------------------------------
    SessionSweep(Vec<String>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => e.fmt(f),
            Error::ConfigError(e) => e.fmt(f),
            Error::SignerError(e) => write!(f, "Signing issue: {e}"),
            Error::DirectoryError(e) => write!(f, "Directory error: {e}"),
            Error::Custom(s) => s.fmt(f),

            Error::AclParse(e) => write!(f, "Malformed ACL: {e}"),
            Error::AuthzManagerNotFound(name) => {
                write!(f, "Authorization manager '{name}' not found")
            }
            Error::AuthzPluginUnknown(name) => {
                write!(f, "Unknown authorization plugin '{name}'")
            }
            Error::UnknownRealm(realm) => {
                write!(f, "Unknown realm '{realm}'")
            }
            Error::AccessDenied { user, resource, operation } => {
                write!(
                    f, "Access denied: user '{}' may not perform '{}' on '{}'",
                    user.as_deref().unwrap_or("anonymous"),
                    operation, resource
                )
            }

            Error::ProfileUnknown(id) => write!(f, "Unknown profile '{id}'"),
            Error::ProfileNotEnabled(id) => {
                write!(f, "Profile Not Enabled: '{id}'")
            }
            Error::AuthorityUnknown(id) => {
                write!(f, "Unknown certificate authority '{id}'")
            }
            Error::InputMissing(name) => {
                write!(f, "Missing request input '{name}'")
            }
            Error::InputInvalid(name, msg) => {
                write!(f, "Invalid request input '{name}': {msg}")
            }
            Error::ConstraintViolation(msg) => {
                write!(f, "Request rejected by policy: {msg}")
            }
            Error::MissingPublicKey => {
                write!(f, "Certificate info carries no usable public key")
            }
            Error::InvalidPublicKey(msg) => {
                write!(f, "Invalid public key: {msg}")
            }
            Error::RequestTerminal(id, status) => {
                write!(
                    f, "Request {id} is {status} and cannot be processed again"
                )
            }
            Error::Profile { msg, cause } => {
                match cause {
                    Some(cause) => write!(f, "{msg}: {cause}"),
                    None => msg.fmt(f),
                }
            }

            Error::KraNotConfigured => {
                write!(f, "No KRA connector configured")
            }
            Error::KraTimeout => {
                write!(f, "KRA request exceeded its deadline")
            }
            Error::KraRejected { msg, .. } => {
                write!(f, "KRA request failed: {msg}")
            }

            Error::IssuanceFailed(msg) => {
                write!(f, "Certificate issuance failed: {msg}")
            }

            Error::SessionSweep(failures) => {
                write!(
                    f, "Session sweep failed to remove {} session(s): {}",
                    failures.len(), failures.join(", ")
                )
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::Profile { cause: Some(cause), .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn signer(msg: impl fmt::Display) -> Self {
        Error::SignerError(msg.to_string())
    }

    pub fn issuance(msg: impl fmt::Display) -> Self {
        Error::IssuanceFailed(msg.to_string())
    }

    pub fn invalid_input(name: &str, msg: impl fmt::Display) -> Self {
        Error::InputInvalid(name.to_string(), msg.to_string())
    }

    pub fn constraint(msg: impl fmt::Display) -> Self {
        Error::ConstraintViolation(msg.to_string())
    }

    pub fn access_denied(
        user: Option<&str>, resource: &str, operation: &str
    ) -> Self {
        Error::AccessDenied {
            user: user.map(ToString::to_string),
            resource: resource.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Wraps an error into a profile level rejection.
    ///
    /// Errors that already are rejections are returned unchanged so that
    /// the original message and terminal flag survive.
    pub fn into_rejection(self, msg: impl fmt::Display) -> Self {
        if self.is_rejection() {
            self
        }
        else {
            Error::Profile {
                msg: msg.to_string(),
                cause: Some(Box::new(self)),
            }
        }
    }

    /// Returns whether this error already is a profile level rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Profile { .. }
            | Error::KraRejected { .. }
            | Error::KraNotConfigured
            | Error::ConstraintViolation(_)
        )
    }

    /// Returns whether the rejection made the request terminally rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::KraRejected { terminal: true, .. }
            | Error::RequestTerminal(..)
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ConfigError(_)
            | Error::AclParse(_)
            | Error::AuthzManagerNotFound(_)
            | Error::AuthzPluginUnknown(_)
            | Error::UnknownRealm(_)
            | Error::ProfileUnknown(_)
            | Error::ProfileNotEnabled(_)
            | Error::AuthorityUnknown(_)
            | Error::KraNotConfigured => ErrorClass::Configuration,

            Error::AccessDenied { .. } => ErrorClass::AccessDenied,

            Error::KraRejected { terminal: true, .. }
            | Error::RequestTerminal(..) => ErrorClass::Terminal,

            Error::KraRejected { .. }
            | Error::KraTimeout => ErrorClass::RemoteRejection,

            Error::Profile { cause: Some(cause), .. } => cause.class(),

            _ => ErrorClass::Internal,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::ConfigError(e)
    }
}

impl From<AclParseError> for Error {
    fn from(e: AclParseError) -> Self {
        Error::AclParse(e)
    }
}

impl From<DirectoryError> for Error {
    fn from(e: DirectoryError) -> Self {
        Error::DirectoryError(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::SignerError(e.to_string())
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_wrapping_keeps_cause() {
        let err = Error::IssuanceFailed("boom".into())
            .into_rejection("Unable to issue");
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "Unable to issue: Certificate issuance failed: boom");
        assert!(error::Error::source(&err).is_some());
    }

    #[test]
    fn rejections_are_not_wrapped_twice() {
        let err = Error::KraRejected { msg: "bad".into(), terminal: true };
        let err = err.into_rejection("Outer");
        assert!(matches!(err, Error::KraRejected { terminal: true, .. }));
        assert!(err.is_terminal());
        assert_eq!(err.class(), ErrorClass::Terminal);
    }

    #[test]
    fn access_denied_is_its_own_class() {
        let err = Error::access_denied(Some("bob"), "certs", "read");
        assert_eq!(err.class(), ErrorClass::AccessDenied);
        assert_eq!(
            Error::UnknownRealm("x".into()).class(),
            ErrorClass::Configuration
        );
    }
}
