//! Access control lists.
//!
//! An ACL protects one named resource. It knows the rights that exist for
//! the resource and holds an ordered list of entries of the form
//!
//! ```text
//! allow|deny (right[,right...]) attribute_expression
//! ```
//!
//! where the attribute expression is made of terms such as
//! `group="Administrators"` joined by `&&` and `||`. A complete ACL is
//! defined by a single line:
//!
//! ```text
//! resource:right[,right...]:entry[;entry...][:description]
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::{error, fmt, str};
use log::{debug, warn};
use serde::Deserialize;
use super::evaluator::{EvaluatorRegistry, Operator};
use super::token::AuthContext;


//------------ AclEntryType --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AclEntryType {
    Allow,
    Deny,
}

impl AclEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            AclEntryType::Allow => "allow",
            AclEntryType::Deny => "deny",
        }
    }
}

impl fmt::Display for AclEntryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ AttrTerm ------------------------------------------------------

/// A single `<type><op><value>` term.
///
/// The value is kept as written, including any quotes, so that the term
/// displays the way it was parsed. Evaluators strip the quotes.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AttrTerm {
    pub attr: String,
    pub op: Operator,
    pub value: String,
}

impl str::FromStr for AttrTerm {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The operator is the first '=' outside quotes, possibly
        // preceded by '!'.
        let Some(pos) = find_outside_quotes(s, "=") else {
            return Err(AclParseError::InvalidTerm(s.trim().into()))
        };
        let value = &s[pos + 1..];
        let (attr, op) = match s[..pos].strip_suffix('!') {
            Some(attr) => (attr, Operator::NotEqual),
            None => (&s[..pos], Operator::Equal),
        };

        let attr = attr.trim();
        let value = value.trim();
        if attr.is_empty() || value.is_empty() {
            return Err(AclParseError::InvalidTerm(s.trim().into()))
        }
        Ok(AttrTerm { attr: attr.into(), op, value: value.into() })
    }
}

impl fmt::Display for AttrTerm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.attr, self.op, self.value)
    }
}


//------------ AttrExpression ------------------------------------------------

/// An attribute expression in disjunctive normal form.
///
/// The outer list is joined by `||`, each inner list by `&&`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AttrExpression(Vec<Vec<AttrTerm>>);

impl AttrExpression {
    /// Returns whether the expression holds for the caller.
    pub fn evaluate(
        &self, ctx: &AuthContext, evaluators: &EvaluatorRegistry
    ) -> bool {
        self.0.iter().any(|all| {
            all.iter().all(|term| {
                evaluators.evaluate(ctx, &term.attr, term.op, &term.value)
            })
        })
    }

    pub fn terms(&self) -> impl Iterator<Item = &AttrTerm> {
        self.0.iter().flatten()
    }
}

impl str::FromStr for AttrExpression {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(AclParseError::MissingExpression(s.into()))
        }
        split_outside_quotes(s, "||").into_iter().map(|any| {
            split_outside_quotes(any, "&&").into_iter().map(str::parse).collect()
        }).collect::<Result<_, _>>().map(AttrExpression)
    }
}

/// Returns the byte position of the first `pat` not inside double quotes.
fn find_outside_quotes(s: &str, pat: &str) -> Option<usize> {
    let mut quoted = false;
    for (i, ch) in s.char_indices() {
        if ch == '"' {
            quoted = !quoted;
        }
        else if !quoted && s[i..].starts_with(pat) {
            return Some(i)
        }
    }
    None
}

/// Splits `s` at every `sep` not inside double quotes.
fn split_outside_quotes<'a>(mut s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut res = Vec::new();
    while let Some(pos) = find_outside_quotes(s, sep) {
        res.push(&s[..pos]);
        s = &s[pos + sep.len()..];
    }
    res.push(s);
    res
}

impl fmt::Display for AttrExpression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, all) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" || ")?;
            }
            for (j, term) in all.iter().enumerate() {
                if j > 0 {
                    f.write_str(" && ")?;
                }
                term.fmt(f)?;
            }
        }
        Ok(())
    }
}


//------------ AclEntry ------------------------------------------------------

/// A single allow or deny rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AclEntry {
    entry_type: AclEntryType,
    rights: BTreeSet<String>,
    expression: AttrExpression,
}

impl AclEntry {
    pub fn entry_type(&self) -> AclEntryType {
        self.entry_type
    }

    pub fn rights(&self) -> impl Iterator<Item = &str> {
        self.rights.iter().map(String::as_str)
    }

    pub fn covers(&self, right: &str) -> bool {
        self.rights.contains(right)
    }

    pub fn expression(&self) -> &AttrExpression {
        &self.expression
    }

    /// Checks the entry’s own verdict for a right.
    ///
    /// Rights the entry doesn’t list are denied. Otherwise allow entries
    /// allow and deny entries deny.
    pub fn check_permission(&self, right: &str) -> bool {
        self.covers(right) && self.entry_type == AclEntryType::Allow
    }

    /// Returns whether the entry’s expression holds for the caller.
    pub fn applies_to(
        &self, ctx: &AuthContext, evaluators: &EvaluatorRegistry
    ) -> bool {
        self.expression.evaluate(ctx, evaluators)
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (", self.entry_type)?;
        for (i, right) in self.rights.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(right)?;
        }
        write!(f, ") {}", self.expression)
    }
}


//------------ AclComposition ------------------------------------------------

/// How the entries of an ACL combine into a decision.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AclComposition {
    /// Every entry covering the right must grant.
    ///
    /// An allow entry grants if its expression holds for the caller, a
    /// deny entry grants if its expression does not.
    #[default]
    All,

    /// The first covering entry whose expression holds decides.
    FirstMatch,
}


//------------ Acl -----------------------------------------------------------

/// The access control list for one resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Acl {
    name: String,
    rights: Vec<String>,
    entries: Vec<AclEntry>,
    description: String,
}

impl Acl {
    pub fn new(
        name: impl Into<String>,
        rights: impl IntoIterator<Item = impl Into<String>>,
        description: impl Into<String>,
    ) -> Self {
        Acl {
            name: name.into(),
            rights: rights.into_iter().map(Into::into).collect(),
            entries: Vec::new(),
            description: description.into(),
        }
    }

    /// Parses an ACL definition line.
    ///
    /// If `strict` is set, entries naming rights the ACL doesn’t define are
    /// rejected. Otherwise such rights are dropped with a warning.
    pub fn parse(line: &str, strict: bool) -> Result<Self, AclParseError> {
        let mut parts = line.trim().splitn(4, ':');
        let name = parts.next().unwrap_or_default().trim();
        let (Some(rights), Some(entries)) = (parts.next(), parts.next()) else {
            return Err(AclParseError::InvalidAcl(line.into()))
        };
        if name.is_empty() {
            return Err(AclParseError::InvalidAcl(line.into()))
        }
        let description = parts.next().unwrap_or_default().trim();

        let mut res = Acl::new(
            name,
            rights.split(',').map(str::trim).filter(|s| !s.is_empty()),
            description
        );
        for text in entries.split(';').filter(|s| !s.trim().is_empty()) {
            let entry = res.parse_entry(text, strict)?;
            res.add_entry(entry);
        }
        Ok(res)
    }

    /// Parses a single entry for this ACL.
    pub fn parse_entry(
        &self, text: &str, strict: bool
    ) -> Result<AclEntry, AclParseError> {
        let text = text.trim();
        let Some((prefix, rest)) = text.split_once(' ') else {
            return Err(AclParseError::UnknownPrefix(text.into()))
        };
        let entry_type = match prefix {
            "allow" => AclEntryType::Allow,
            "deny" => AclEntryType::Deny,
            _ => return Err(AclParseError::UnknownPrefix(prefix.into())),
        };

        let rest = rest.trim_start();
        let Some((rights, expression)) = rest.strip_prefix('(').and_then(|s| {
            s.split_once(')')
        }) else {
            return Err(AclParseError::MissingRights(text.into()))
        };

        let mut entry_rights = BTreeSet::new();
        for right in rights.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if self.has_right(right) {
                entry_rights.insert(right.to_string());
            }
            else if strict {
                return Err(AclParseError::InvalidRight {
                    resource: self.name.clone(),
                    right: right.into(),
                })
            }
            else {
                warn!(
                    "Skipping invalid right '{}' in ACL entry for '{}'",
                    right, self.name
                );
            }
        }

        Ok(AclEntry {
            entry_type,
            rights: entry_rights,
            expression: expression.parse()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn rights(&self) -> impl Iterator<Item = &str> {
        self.rights.iter().map(String::as_str)
    }

    pub fn has_right(&self, right: &str) -> bool {
        self.rights.iter().any(|item| item == right)
    }

    pub fn add_entry(&mut self, entry: AclEntry) {
        self.entries.push(entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = &AclEntry> {
        self.entries.iter()
    }

    /// Decides whether the caller holds `right` on this resource.
    ///
    /// Without any entry covering the right, access is denied.
    pub fn check_permission(
        &self,
        ctx: &AuthContext,
        right: &str,
        evaluators: &EvaluatorRegistry,
        composition: AclComposition,
    ) -> bool {
        let mut covering = self.entries().filter(|entry| entry.covers(right));
        let res = match composition {
            AclComposition::All => {
                let mut seen = false;
                let granted = covering.all(|entry| {
                    seen = true;
                    let applies = entry.applies_to(ctx, evaluators);
                    match entry.entry_type {
                        AclEntryType::Allow => applies,
                        AclEntryType::Deny => !applies,
                    }
                });
                seen && granted
            }
            AclComposition::FirstMatch => {
                covering.find(|entry| {
                    entry.applies_to(ctx, evaluators)
                }).is_some_and(|entry| entry.check_permission(right))
            }
        };
        debug!(
            "ACL '{}' {} right '{}' for {}",
            self.name,
            if res { "grants" } else { "denies" },
            right,
            ctx.user_id().unwrap_or("anonymous")
        );
        res
    }
}

impl str::FromStr for Acl {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, false)
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:", self.name, self.rights.join(","))?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            entry.fmt(f)?;
        }
        if !self.description.is_empty() {
            write!(f, ":{}", self.description)?;
        }
        Ok(())
    }
}


//------------ AclStore ------------------------------------------------------

/// The ACLs of all protected resources.
#[derive(Clone, Debug, Default)]
pub struct AclStore {
    acls: HashMap<String, Arc<Acl>>,
}

impl AclStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads ACLs from their definition lines.
    pub fn from_definitions<S: AsRef<str>>(
        lines: &[S], strict: bool
    ) -> Result<Self, AclParseError> {
        let mut res = Self::new();
        for line in lines {
            res.insert(Acl::parse(line.as_ref(), strict)?);
        }
        Ok(res)
    }

    pub fn insert(&mut self, acl: Acl) {
        self.acls.insert(acl.name.clone(), Arc::new(acl));
    }

    pub fn get(&self, resource: &str) -> Option<Arc<Acl>> {
        self.acls.get(resource).cloned()
    }

    pub fn len(&self) -> usize {
        self.acls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acls.is_empty()
    }
}


//------------ AclParseError -------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AclParseError {
    UnknownPrefix(String),
    MissingRights(String),
    MissingExpression(String),
    InvalidTerm(String),
    InvalidRight { resource: String, right: String },
    InvalidAcl(String),
}

impl fmt::Display for AclParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AclParseError::UnknownPrefix(s) => {
                write!(f, "expected 'allow' or 'deny', found '{s}'")
            }
            AclParseError::MissingRights(s) => {
                write!(f, "missing parenthesized rights in '{s}'")
            }
            AclParseError::MissingExpression(s) => {
                write!(f, "missing attribute expression in '{s}'")
            }
            AclParseError::InvalidTerm(s) => {
                write!(f, "invalid attribute term '{s}'")
            }
            AclParseError::InvalidRight { resource, right } => {
                write!(f, "right '{right}' is not defined for '{resource}'")
            }
            AclParseError::InvalidAcl(s) => {
                write!(f, "invalid ACL definition '{s}'")
            }
        }
    }
}

impl error::Error for AclParseError { }


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::token::AuthToken;
    use crate::authz::users::MemoryUserGroups;

    fn evaluators() -> EvaluatorRegistry {
        EvaluatorRegistry::with_builtins(Arc::new(MemoryUserGroups::new()))
    }

    fn certs_acl() -> Acl {
        Acl::new("certServer.ca.certs", ["read", "list", "revoke"], "")
    }

    fn ctx(user: &str, groups: &[&str]) -> AuthContext {
        AuthContext::new(
            AuthToken::for_user(user).with_list(
                AuthToken::GROUPS, groups.iter().copied()
            )
        )
    }

    #[test]
    fn parse_entry() {
        let acl = certs_acl();
        let entry = acl.parse_entry(
            r#"allow (read,list) group="Administrators""#, false
        ).unwrap();
        assert_eq!(entry.entry_type(), AclEntryType::Allow);
        assert_eq!(entry.rights().collect::<Vec<_>>(), ["list", "read"]);
        let term = entry.expression().terms().next().unwrap();
        assert_eq!(term.attr, "group");
        assert_eq!(term.op, Operator::Equal);
        assert_eq!(term.value, "\"Administrators\"");
    }

    #[test]
    fn operators_inside_quotes_belong_to_the_value() {
        let term: AttrTerm = r#"user="a!=b""#.parse().unwrap();
        assert_eq!(term.attr, "user");
        assert_eq!(term.op, Operator::Equal);
        assert_eq!(term.value, r#""a!=b""#);

        let term: AttrTerm = r#"user!="x=y""#.parse().unwrap();
        assert_eq!(term.attr, "user");
        assert_eq!(term.op, Operator::NotEqual);
        assert_eq!(term.value, r#""x=y""#);

        let expr: AttrExpression =
            r#"group="R&&D || Ops" || user="bob&&alice""#.parse().unwrap();
        assert_eq!(expr.terms().count(), 2);
        assert_eq!(expr.to_string().parse::<AttrExpression>().unwrap(), expr);

        let acl = certs_acl();
        let entry = acl.parse_entry(r#"deny (read) user="a!=b""#, false).unwrap();
        assert_eq!(acl.parse_entry(&entry.to_string(), false).unwrap(), entry);
    }

    #[test]
    fn unknown_prefix_fails() {
        let acl = certs_acl();
        assert_eq!(
            acl.parse_entry("permit (read) user=anybody", false),
            Err(AclParseError::UnknownPrefix("permit".into()))
        );
        assert!(acl.parse_entry("allow", false).is_err());
        assert!(acl.parse_entry("allow read user=anybody", false).is_err());
        assert!(acl.parse_entry("allow (read)", false).is_err());
        assert!(acl.parse_entry("allow (read) user", false).is_err());
    }

    #[test]
    fn invalid_rights_are_skipped_unless_strict() {
        let acl = certs_acl();
        let entry = acl.parse_entry("allow (read,fly) user=anybody", false)
            .unwrap();
        assert_eq!(entry.rights().collect::<Vec<_>>(), ["read"]);
        assert!(!entry.check_permission("fly"));

        assert_eq!(
            acl.parse_entry("allow (read,fly) user=anybody", true),
            Err(AclParseError::InvalidRight {
                resource: "certServer.ca.certs".into(),
                right: "fly".into()
            })
        );
    }

    #[test]
    fn entry_denies_unlisted_rights() {
        let acl = certs_acl();
        let allow = acl.parse_entry("allow (read) user=anybody", false).unwrap();
        let deny = acl.parse_entry("deny (read) user=anybody", false).unwrap();
        assert!(allow.check_permission("read"));
        assert!(!allow.check_permission("list"));
        assert!(!deny.check_permission("read"));
        assert!(!deny.check_permission("list"));
    }

    #[test]
    fn entry_display_round_trips() {
        let acl = certs_acl();
        for text in [
            r#"allow (read,list) group="Administrators""#,
            r#"deny (revoke) user!="alice" && ipaddress="10\..*""#,
            r#"allow (list,read,revoke) group="Agents" || user="bob" && ipaddress="127.0.0.1""#,
        ] {
            let entry = acl.parse_entry(text, false).unwrap();
            let again = acl.parse_entry(&entry.to_string(), false).unwrap();
            assert_eq!(entry, again);
        }
        let entry = acl.parse_entry("allow (list,read) user=bob", false).unwrap();
        let reordered = acl.parse_entry("allow (read,list) user=bob", false).unwrap();
        assert_eq!(entry, reordered);
    }

    #[test]
    fn deny_is_never_overridden_by_allow() {
        let mut acl = certs_acl();
        acl.add_entry(acl.parse_entry(r#"allow (read) group="Agents""#, false).unwrap());
        acl.add_entry(acl.parse_entry(r#"deny (read) user="bob""#, false).unwrap());
        let reg = evaluators();

        let bob = ctx("bob", &["Agents"]);
        let carol = ctx("carol", &["Agents"]);
        assert!(!acl.check_permission(&bob, "read", &reg, AclComposition::All));
        assert!(acl.check_permission(&carol, "read", &reg, AclComposition::All));
    }

    #[test]
    fn first_match_composition() {
        let mut acl = certs_acl();
        acl.add_entry(acl.parse_entry(r#"allow (read) user="bob""#, false).unwrap());
        acl.add_entry(acl.parse_entry(r#"deny (read) group="Agents""#, false).unwrap());
        let reg = evaluators();

        let bob = ctx("bob", &["Agents"]);
        let carol = ctx("carol", &["Agents"]);
        assert!(acl.check_permission(&bob, "read", &reg, AclComposition::FirstMatch));
        assert!(!acl.check_permission(&carol, "read", &reg, AclComposition::FirstMatch));
        assert!(!acl.check_permission(&bob, "read", &reg, AclComposition::All));
    }

    #[test]
    fn uncovered_rights_are_denied() {
        let mut acl = certs_acl();
        acl.add_entry(acl.parse_entry("allow (read) user=anybody", false).unwrap());
        let reg = evaluators();
        let bob = ctx("bob", &[]);
        for composition in [AclComposition::All, AclComposition::FirstMatch] {
            assert!(acl.check_permission(&bob, "read", &reg, composition));
            assert!(!acl.check_permission(&bob, "list", &reg, composition));
        }
    }

    #[test]
    fn parse_acl_definition() {
        let line = "certServer.ca.certs:read,list,revoke:\
                    allow (read,list) group=\"Agents\";\
                    deny (revoke) user=\"bob\":Certificate access";
        let acl: Acl = line.parse().unwrap();
        assert_eq!(acl.name(), "certServer.ca.certs");
        assert_eq!(acl.rights().collect::<Vec<_>>(), ["read", "list", "revoke"]);
        assert_eq!(acl.entries().count(), 2);
        assert_eq!(acl.description(), "Certificate access");
        assert_eq!(acl.to_string().parse::<Acl>().unwrap(), acl);

        assert!(Acl::parse("certServer.ca.certs", false).is_err());
        assert!(Acl::parse("certServer.ca.certs:read:permit (read) user=x", false).is_err());
    }
}
