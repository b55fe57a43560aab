//! A session table stored in a directory service.
//!
//! Sessions are entries `cn=<session id>` below the session container,
//! `ou=sessions,ou=Security Domain,<base dn>`. The directory protocol
//! itself is behind [`DirectoryConnection`]. Connections come from a
//! [`DirectoryPool`] and go back to it when an operation finishes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::{error, fmt};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use super::{SessionEntry, SessionTable};
use crate::commons::{Error, PkiEmptyResult, PkiResult};
use crate::constants::{SESSION_CONTAINER_RDN, SESSION_OBJECT_CLASS};


const ATTR_OBJECT_CLASS: &str = "objectClass";
const ATTR_SESSION_ID: &str = "cn";
const ATTR_HOST: &str = "host";
const ATTR_UID: &str = "uid";
const ATTR_GROUP: &str = "securityDomainGroup";
const ATTR_BEGIN: &str = "dateOfCreate";


//------------ DirectoryError ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirectoryError {
    AlreadyExists(String),
    NoSuchObject(String),
    Other(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirectoryError::AlreadyExists(dn) => {
                write!(f, "entry '{dn}' already exists")
            }
            DirectoryError::NoSuchObject(dn) => {
                write!(f, "no such entry '{dn}'")
            }
            DirectoryError::Other(msg) => msg.fmt(f),
        }
    }
}

impl error::Error for DirectoryError { }


//------------ DirectoryEntry ------------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        DirectoryEntry { dn: dn.into(), attributes: BTreeMap::new() }
    }

    pub fn with(mut self, attr: &str, value: impl Into<String>) -> Self {
        self.attributes.entry(attr.into()).or_default().push(value.into());
        self
    }

    /// Returns the first value of an attribute.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attributes.iter().find(|(name, _)| {
            name.eq_ignore_ascii_case(attr)
        }).and_then(|(_, values)| values.first()).map(String::as_str)
    }
}


//------------ SearchScope ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}


//------------ DirectoryConnection -------------------------------------------

/// A connection to the directory service.
pub trait DirectoryConnection: Send {
    fn add(&mut self, entry: &DirectoryEntry) -> Result<(), DirectoryError>;

    fn delete(&mut self, dn: &str) -> Result<(), DirectoryError>;

    /// Searches for entries, returning only the requested attributes.
    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError>;
}


//------------ DirectoryPool -------------------------------------------------

/// Hands out directory connections.
pub trait DirectoryPool: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn DirectoryConnection>, DirectoryError>;

    fn release(&self, conn: Box<dyn DirectoryConnection>);
}


//------------ DirectorySessionTable -----------------------------------------

pub struct DirectorySessionTable {
    pool: Arc<dyn DirectoryPool>,
    container: String,
    ttl: Duration,
}

impl DirectorySessionTable {
    /// Creates the table, making sure the session container exists.
    pub fn new(
        pool: Arc<dyn DirectoryPool>, base_dn: &str, ttl: Duration
    ) -> PkiResult<Self> {
        let res = DirectorySessionTable {
            pool,
            container: format!("{SESSION_CONTAINER_RDN},{base_dn}"),
            ttl,
        };
        res.ensure_container(base_dn)?;
        Ok(res)
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Runs an operation on a pooled connection.
    ///
    /// The connection is released whatever the outcome of the operation.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut dyn DirectoryConnection) -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let mut conn = self.pool.acquire()?;
        let res = op(conn.as_mut());
        self.pool.release(conn);
        res
    }

    /// Adds the container and its parent, tolerating concurrent creation.
    fn ensure_container(&self, base_dn: &str) -> PkiEmptyResult {
        self.with_connection(|conn| {
            let mut dn = base_dn.to_string();
            for rdn in SESSION_CONTAINER_RDN.rsplit(',') {
                dn = format!("{rdn},{dn}");
                let ou = rdn.split_once('=').map(|(_, v)| v).unwrap_or(rdn);
                let entry = DirectoryEntry::new(dn.as_str())
                    .with(ATTR_OBJECT_CLASS, "top")
                    .with(ATTR_OBJECT_CLASS, "organizationalUnit")
                    .with("ou", ou);
                match conn.add(&entry) {
                    Ok(()) => info!("Created session container '{dn}'"),
                    Err(DirectoryError::AlreadyExists(_)) => {
                        debug!("Session container '{dn}' exists")
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn entry_dn(&self, session_id: &str) -> String {
        format!("cn={},{}", escape_dn_value(session_id), self.container)
    }

    fn to_session(entry: &DirectoryEntry) -> PkiResult<SessionEntry> {
        let attr = |name: &str| -> PkiResult<String> {
            entry.first(name).map(ToString::to_string).ok_or_else(|| {
                Error::custom(format!(
                    "Session entry '{}' lacks attribute '{}'", entry.dn, name
                ))
            })
        };
        let millis = attr(ATTR_BEGIN)?.parse::<i64>().map_err(|e| {
            Error::custom(format!("Bad {} in '{}': {}", ATTR_BEGIN, entry.dn, e))
        })?;
        let begin_time: DateTime<Utc> = Utc.timestamp_millis_opt(
            millis
        ).single().ok_or_else(|| {
            Error::custom(format!("Bad {} in '{}'", ATTR_BEGIN, entry.dn))
        })?;
        Ok(SessionEntry {
            session_id: attr(ATTR_SESSION_ID)?,
            ip: attr(ATTR_HOST)?,
            uid: attr(ATTR_UID)?,
            group: attr(ATTR_GROUP)?,
            begin_time,
        })
    }
}

impl SessionTable for DirectorySessionTable {
    fn add(&self, entry: SessionEntry) -> PkiEmptyResult {
        let dir_entry = DirectoryEntry::new(self.entry_dn(&entry.session_id))
            .with(ATTR_OBJECT_CLASS, "top")
            .with(ATTR_OBJECT_CLASS, SESSION_OBJECT_CLASS)
            .with(ATTR_SESSION_ID, entry.session_id.as_str())
            .with(ATTR_HOST, entry.ip.as_str())
            .with(ATTR_UID, entry.uid.as_str())
            .with(ATTR_GROUP, entry.group.as_str())
            .with(ATTR_BEGIN, entry.begin_time.timestamp_millis().to_string());
        self.with_connection(|conn| conn.add(&dir_entry))?;
        debug!("Added session '{}' for '{}'", entry.session_id, entry.uid);
        Ok(())
    }

    fn remove_entry(&self, session_id: &str) -> PkiEmptyResult {
        let dn = self.entry_dn(session_id);
        match self.with_connection(|conn| conn.delete(&dn)) {
            Ok(()) => {
                debug!("Removed session '{session_id}'");
                Ok(())
            }
            Err(DirectoryError::NoSuchObject(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, session_id: &str) -> PkiResult<Option<SessionEntry>> {
        let filter = format!(
            "(&({}={})({}={}))",
            ATTR_OBJECT_CLASS, SESSION_OBJECT_CLASS,
            ATTR_SESSION_ID, escape_filter_value(session_id)
        );
        let found = self.with_connection(|conn| conn.search(
            &self.container, SearchScope::OneLevel, &filter,
            &[ATTR_SESSION_ID, ATTR_HOST, ATTR_UID, ATTR_GROUP, ATTR_BEGIN],
        ));
        match found {
            Ok(entries) => entries.first().map(Self::to_session).transpose(),
            Err(DirectoryError::NoSuchObject(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn session_ids(&self) -> PkiResult<Vec<String>> {
        let filter = format!("({ATTR_OBJECT_CLASS}={SESSION_OBJECT_CLASS})");
        let entries = self.with_connection(|conn| conn.search(
            &self.container, SearchScope::OneLevel, &filter, &[ATTR_SESSION_ID]
        ))?;
        Ok(entries.iter().filter_map(|entry| {
            entry.first(ATTR_SESSION_ID).map(ToString::to_string)
        }).collect())
    }

    fn size(&self) -> PkiResult<usize> {
        Ok(self.session_ids()?.len())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl fmt::Debug for DirectorySessionTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DirectorySessionTable")
            .field("container", &self.container)
            .field("ttl", &self.ttl)
            .finish()
    }
}


//------------ Escaping ------------------------------------------------------

/// Escapes an attribute value for use in a DN.
pub fn escape_dn_value(value: &str) -> String {
    let mut res = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                res.push('\\');
                res.push(ch);
            }
            '#' | ' ' if idx == 0 => {
                res.push('\\');
                res.push(ch);
            }
            _ => res.push(ch),
        }
    }
    if res.ends_with(' ') && !res.ends_with("\\ ") {
        res.pop();
        res.push_str("\\ ");
    }
    res
}

/// Escapes an attribute value for use in a search filter.
pub fn escape_filter_value(value: &str) -> String {
    let mut res = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => res.push_str("\\2a"),
            '(' => res.push_str("\\28"),
            ')' => res.push_str("\\29"),
            '\\' => res.push_str("\\5c"),
            '\0' => res.push_str("\\00"),
            _ => res.push(ch),
        }
    }
    res
}


//============ Tests =========================================================
