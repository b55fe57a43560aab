//! Authentication tokens and the context handed to authorization.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::constants::ORIG_REQ_PREFIX;


//------------ TokenValue ----------------------------------------------------

/// A value stored in an authentication token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TokenValue {
    Str(String),
    List(Vec<String>),
}


//------------ AuthToken -----------------------------------------------------

/// The read-only result of authenticating a caller.
///
/// The token is a bag of named values produced by an authentication
/// provider. Authorization only reads from it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuthToken(HashMap<String, TokenValue>);

impl AuthToken {
    pub const USER_ID: &'static str = "userid";
    pub const UID: &'static str = "uid";
    pub const GROUPS: &'static str = "groups";

    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token for the given user.
    pub fn for_user(user_id: &str) -> Self {
        Self::new().with(Self::USER_ID, user_id).with(Self::UID, user_id)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.into(), TokenValue::Str(value.into()));
        self
    }

    pub fn with_list<I, S>(mut self, key: &str, values: I) -> Self
    where I: IntoIterator<Item = S>, S: Into<String> {
        self.0.insert(
            key.into(),
            TokenValue::List(values.into_iter().map(Into::into).collect())
        );
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            TokenValue::Str(s) => Some(s.as_str()),
            TokenValue::List(_) => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key)? {
            TokenValue::List(list) => Some(list.as_slice()),
            TokenValue::Str(_) => None,
        }
    }

    /// Returns the user id, falling back to the uid.
    pub fn user_id(&self) -> Option<&str> {
        self.get_string(Self::USER_ID).or_else(|| self.get_string(Self::UID))
    }

    /// Returns the inline group list if the provider supplied one.
    pub fn groups(&self) -> Option<&[String]> {
        self.get_list(Self::GROUPS)
    }
}


//------------ AuthContext ---------------------------------------------------

/// Everything authorization may look at for one call.
///
/// This is passed explicitly through every call that needs to know who is
/// asking, from where, and what the session remembers about the original
/// request.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    token: Option<Arc<AuthToken>>,
    ip_address: Option<String>,
    session: HashMap<String, String>,
}

impl AuthContext {
    /// Creates a context with nothing in it.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(token: AuthToken) -> Self {
        AuthContext {
            token: Some(Arc::new(token)),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_session_value(
        mut self, key: impl Into<String>, value: impl Into<String>
    ) -> Self {
        self.session.insert(key.into(), value.into());
        self
    }

    /// Remembers a field of the original request for renewal checks.
    pub fn with_orig_req(self, field: &str, value: impl Into<String>) -> Self {
        self.with_session_value(format!("{ORIG_REQ_PREFIX}{field}"), value)
    }

    pub fn token(&self) -> Option<&AuthToken> {
        self.token.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.token()?.user_id()
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn session_value(&self, key: &str) -> Option<&str> {
        self.session.get(key).map(String::as_str)
    }
}


//------------ AuthzToken ----------------------------------------------------

/// Proof that an authorization manager granted access.
///
/// Only authorization managers create these. Denial is signalled by an
/// error rather than a missing token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthzToken {
    manager: String,
    resource: String,
    operation: String,
    user_id: Option<String>,
    granted_at: DateTime<Utc>,
}

impl AuthzToken {
    pub(super) fn grant(
        manager: &str, resource: &str, operation: &str, ctx: &AuthContext
    ) -> Self {
        AuthzToken {
            manager: manager.into(),
            resource: resource.into(),
            operation: operation.into(),
            user_id: ctx.user_id().map(ToString::to_string),
            granted_at: Utc::now(),
        }
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_falls_back_to_uid() {
        let token = AuthToken::new().with(AuthToken::UID, "bob");
        assert_eq!(token.user_id(), Some("bob"));

        let token = token.with(AuthToken::USER_ID, "robert");
        assert_eq!(token.user_id(), Some("robert"));
    }

    #[test]
    fn typed_getters_do_not_cross_types() {
        let token = AuthToken::for_user("bob")
            .with_list(AuthToken::GROUPS, ["Admins"]);
        assert_eq!(token.get_string(AuthToken::GROUPS), None);
        assert_eq!(token.get_list(AuthToken::USER_ID), None);
        assert_eq!(token.groups().unwrap(), ["Admins".to_string()]);
    }

    #[test]
    fn orig_req_values_are_prefixed() {
        let ctx = AuthContext::anonymous().with_orig_req("auth_token.uid", "bob");
        assert_eq!(ctx.session_value("orig_req.auth_token.uid"), Some("bob"));
        assert_eq!(ctx.user_id(), None);
    }
}
