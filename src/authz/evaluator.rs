//! Access evaluators.
//!
//! An access evaluator decides whether a single attribute term of an ACL
//! entry, such as `group="Administrators"`, holds for the caller. All
//! evaluators fail closed: whenever the information they need is missing or
//! cannot be resolved, they answer `false`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::{fmt, str};
use log::{debug, warn};
use regex::Regex;
use super::token::AuthContext;
use super::users::UserGroups;
use crate::constants::ORIG_REQ_PREFIX;


//------------ Operator ------------------------------------------------------

/// The comparison operator of an attribute term.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operator {
    Equal,
    NotEqual,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
        }
    }

    /// Applies the operator to the outcome of an equality test.
    fn apply(self, equal: bool) -> bool {
        match self {
            Operator::Equal => equal,
            Operator::NotEqual => !equal,
        }
    }
}

impl str::FromStr for Operator {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Operator::Equal),
            "!=" => Ok(Operator::NotEqual),
            _ => Err("unknown operator"),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ strip_quotes --------------------------------------------------

/// Removes surrounding double quotes from an expression value.
pub fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}


//------------ AccessEvaluator -----------------------------------------------

/// Decides attribute terms of one type.
pub trait AccessEvaluator: Send + Sync {
    /// The attribute type this evaluator handles, e.g. `"group"`.
    fn attr_type(&self) -> &'static str;

    /// The operators this evaluator supports.
    fn operators(&self) -> &'static [Operator] {
        &[Operator::Equal, Operator::NotEqual]
    }

    /// Evaluates the term `<attr_type><op><value>` for the caller.
    ///
    /// Returns `false` if `attr_type` is not this evaluator’s type, if the
    /// operator isn’t supported, or if required context data is missing.
    fn evaluate(
        &self, ctx: &AuthContext, attr_type: &str, op: Operator, value: &str
    ) -> bool {
        if attr_type != self.attr_type() || !self.operators().contains(&op) {
            return false
        }
        self.evaluate_term(ctx, op, strip_quotes(value))
    }

    /// Evaluates a term known to be of the right type with an unquoted value.
    fn evaluate_term(
        &self, ctx: &AuthContext, op: Operator, value: &str
    ) -> bool;
}


//------------ UserEvaluator -------------------------------------------------

/// Matches the caller’s user id.
///
/// The special values `anybody` and `everybody` match any identified
/// caller when used with `=`.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserEvaluator;

impl AccessEvaluator for UserEvaluator {
    fn attr_type(&self) -> &'static str {
        "user"
    }

    fn evaluate_term(
        &self, ctx: &AuthContext, op: Operator, value: &str
    ) -> bool {
        let Some(user_id) = ctx.user_id() else {
            debug!("user evaluator: no user id available");
            return false
        };
        if op == Operator::Equal
            && (value == "anybody" || value == "everybody")
        {
            return true
        }
        op.apply(value.eq_ignore_ascii_case(user_id))
    }
}


//------------ GroupEvaluator ------------------------------------------------

/// Matches the caller’s group membership.
///
/// Inline group lists in the token take precedence. Without them, the user
/// and group directory is asked.
#[derive(Clone)]
pub struct GroupEvaluator {
    users: Arc<dyn UserGroups>,
}

impl GroupEvaluator {
    pub fn new(users: Arc<dyn UserGroups>) -> Self {
        GroupEvaluator { users }
    }

    /// Resolves membership, returning `None` if it cannot be determined.
    pub fn is_member(&self, ctx: &AuthContext, group: &str) -> Option<bool> {
        let token = ctx.token()?;
        if let Some(groups) = token.groups() {
            return Some(groups.iter().any(|item| item == group))
        }

        let user_id = token.user_id()?;
        let user = match self.users.get_user(user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!("group evaluator: unknown user '{user_id}'");
                return None
            }
            Err(err) => {
                warn!("group evaluator: cannot look up '{user_id}': {err}");
                return None
            }
        };
        match self.users.is_member_of(&user, group) {
            Ok(res) => Some(res),
            Err(err) => {
                warn!(
                    "group evaluator: cannot check membership of \
                     '{user_id}' in '{group}': {err}"
                );
                None
            }
        }
    }
}

impl fmt::Debug for GroupEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("GroupEvaluator")
    }
}

impl AccessEvaluator for GroupEvaluator {
    fn attr_type(&self) -> &'static str {
        "group"
    }

    fn evaluate_term(
        &self, ctx: &AuthContext, op: Operator, value: &str
    ) -> bool {
        match self.is_member(ctx, value) {
            Some(member) => op.apply(member),
            None => false,
        }
    }
}


//------------ IpAddressEvaluator --------------------------------------------

/// Matches the caller’s IP address against a regular expression.
///
/// The expression has to match the whole address. Patterns are compiled
/// once and kept, invalid ones included.
#[derive(Debug, Default)]
pub struct IpAddressEvaluator {
    patterns: RwLock<HashMap<String, Option<Regex>>>,
}

impl IpAddressEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of patterns compiled so far.
    pub fn compiled_patterns(&self) -> usize {
        self.patterns.read().expect("poisoned lock").len()
    }

    fn is_match(&self, value: &str, ip: &str) -> Option<bool> {
        if let Some(pattern) = self.patterns.read().expect(
            "poisoned lock"
        ).get(value) {
            return pattern.as_ref().map(|pattern| pattern.is_match(ip))
        }

        let pattern = match Regex::new(&format!("^(?:{value})$")) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!("ipaddress evaluator: invalid pattern '{value}': {err}");
                None
            }
        };
        let res = pattern.as_ref().map(|pattern| pattern.is_match(ip));
        self.patterns.write().expect("poisoned lock").insert(
            value.to_string(), pattern
        );
        res
    }
}

impl AccessEvaluator for IpAddressEvaluator {
    fn attr_type(&self) -> &'static str {
        "ipaddress"
    }

    fn evaluate_term(
        &self, ctx: &AuthContext, op: Operator, value: &str
    ) -> bool {
        let Some(ip) = ctx.ip_address() else {
            debug!("ipaddress evaluator: no IP address available");
            return false
        };
        match self.is_match(value, ip) {
            Some(matched) => op.apply(matched),
            None => false,
        }
    }
}


//------------ UserOrigReqEvaluator ------------------------------------------

/// Matches the caller against the requester of an original request.
///
/// The value names a field remembered in the session under
/// `orig_req.<field>`. Used for renewal where the original requester has
/// to be the current actor.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserOrigReqEvaluator;

impl AccessEvaluator for UserOrigReqEvaluator {
    fn attr_type(&self) -> &'static str {
        "user_origreq"
    }

    fn evaluate_term(
        &self, ctx: &AuthContext, op: Operator, value: &str
    ) -> bool {
        let Some(user_id) = ctx.user_id() else {
            return false
        };
        let key = format!("{ORIG_REQ_PREFIX}{value}");
        let Some(orig) = ctx.session_value(&key) else {
            debug!("user_origreq evaluator: no '{key}' in session");
            return false
        };
        op.apply(orig.eq_ignore_ascii_case(user_id))
    }
}


//------------ EvaluatorRegistry ---------------------------------------------

/// The evaluators available to ACL evaluation, keyed by attribute type.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<&'static str, Arc<dyn AccessEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the four built-in evaluators.
    pub fn with_builtins(users: Arc<dyn UserGroups>) -> Self {
        let mut res = Self::new();
        res.register(Arc::new(UserEvaluator));
        res.register(Arc::new(GroupEvaluator::new(users)));
        res.register(Arc::new(IpAddressEvaluator::new()));
        res.register(Arc::new(UserOrigReqEvaluator));
        res
    }

    pub fn register(&mut self, evaluator: Arc<dyn AccessEvaluator>) {
        self.evaluators.insert(evaluator.attr_type(), evaluator);
    }

    pub fn contains(&self, attr_type: &str) -> bool {
        self.evaluators.contains_key(attr_type)
    }

    /// Evaluates a term, answering `false` for unknown attribute types.
    pub fn evaluate(
        &self, ctx: &AuthContext, attr_type: &str, op: Operator, value: &str
    ) -> bool {
        match self.evaluators.get(attr_type) {
            Some(evaluator) => evaluator.evaluate(ctx, attr_type, op, value),
            None => {
                warn!("No access evaluator for attribute type '{attr_type}'");
                false
            }
        }
    }
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut types: Vec<_> = self.evaluators.keys().collect();
        types.sort();
        f.debug_tuple("EvaluatorRegistry").field(&types).finish()
    }
}


//============ Tests =========================================================
