//! Audit events and the sinks that record them.
//!
//! Every success or failure transition of an external round trip, every
//! authorization decision and every session removal emits exactly one
//! [`AuditEvent`]. Sinks are append-only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use crate::constants::AUDIT_LOG_TARGET;


//------------ AuditEventKind ------------------------------------------------

/// The kind of an audit event.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    /// An authorization decision.
    Authz,

    /// Phase one of server-side key generation.
    ServerSideKeygenRequest,

    /// Phase two of server-side key generation.
    ServerSideKeygenRetrieve,

    /// Archival of a client generated key with the KRA.
    KeyArchivalRequest,

    /// The final outcome of certificate request processing.
    CertRequestProcessed,

    /// Removal of an expired security domain session.
    SecurityDomainSessionTimeout,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AuditEventKind::Authz => "AUTHZ",
            AuditEventKind::ServerSideKeygenRequest => {
                "SERVER_SIDE_KEYGEN_REQUEST"
            }
            AuditEventKind::ServerSideKeygenRetrieve => {
                "SERVER_SIDE_KEYGEN_RETRIEVE"
            }
            AuditEventKind::KeyArchivalRequest => "KEY_ARCHIVAL_REQUEST",
            AuditEventKind::CertRequestProcessed => "CERT_REQUEST_PROCESSED",
            AuditEventKind::SecurityDomainSessionTimeout => {
                "SECURITY_DOMAIN_SESSION_TIMEOUT"
            }
        })
    }
}


//------------ Outcome -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "Success",
            Outcome::Failure => "Failure",
        })
    }
}


//------------ AuditEvent ----------------------------------------------------

/// A single audit record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuditEvent {
    pub time: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub outcome: Outcome,

    /// The user the event is attributed to, if known.
    pub subject_id: Option<String>,

    /// Event specific attributes.
    pub attributes: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, outcome: Outcome) -> Self {
        AuditEvent {
            time: Utc::now(),
            kind,
            outcome,
            subject_id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn success(kind: AuditEventKind) -> Self {
        Self::new(kind, Outcome::Success)
    }

    pub fn failure(kind: AuditEventKind) -> Self {
        Self::new(kind, Outcome::Failure)
    }

    pub fn with_subject(mut self, subject: Option<&str>) -> Self {
        self.subject_id = subject.map(ToString::to_string);
        self
    }

    pub fn with(
        mut self, key: impl Into<String>, value: impl fmt::Display
    ) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "{} [AuditEvent={}][SubjectID={}][Outcome={}]",
            self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind,
            self.subject_id.as_deref().unwrap_or("$Unidentified$"),
            self.outcome,
        )?;
        for (key, value) in &self.attributes {
            write!(f, "[{key}={value}]")?;
        }
        Ok(())
    }
}


//------------ AuditSink -----------------------------------------------------

/// An append-only destination for audit events.
pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}


//------------ AuditFormat ---------------------------------------------------

/// How audit events are written to the log.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    /// The bracketed one-line format of [`AuditEvent`]'s `Display`.
    #[default]
    Text,

    /// One JSON object per event.
    Json,
}


//------------ LogAuditSink --------------------------------------------------

/// Writes audit events to the dedicated audit log target.
///
/// Where that target ends up is decided by the logging configuration, see
/// [`Config::init_logging`][crate::config::Config::init_logging].
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAuditSink {
    format: AuditFormat,
}

impl LogAuditSink {
    pub fn new(format: AuditFormat) -> Self {
        LogAuditSink { format }
    }

    fn render(&self, event: &AuditEvent) -> String {
        match self.format {
            AuditFormat::Text => event.to_string(),
            AuditFormat::Json => match serde_json::to_string(event) {
                Ok(json) => json,
                Err(err) => {
                    warn!("Cannot encode audit event as JSON: {err}");
                    event.to_string()
                }
            },
        }
    }
}

impl AuditSink for LogAuditSink {
    fn log(&self, event: AuditEvent) {
        let line = self.render(&event);
        match event.outcome {
            Outcome::Success => info!(target: AUDIT_LOG_TARGET, "{line}"),
            Outcome::Failure => warn!(target: AUDIT_LOG_TARGET, "{line}"),
        }
    }
}


//------------ MemoryAuditSink -----------------------------------------------

/// Keeps audit events in memory.
///
/// Used by embedding applications that ship audit events elsewhere and by
/// tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("poisoned lock").clone()
    }

    /// Returns the events of the given kind.
    pub fn events_of(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events.lock().expect("poisoned lock").iter().filter(|event| {
            event.kind == kind
        }).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, event: AuditEvent) {
        self.events.lock().expect("poisoned lock").push(event)
    }
}


//============ Tests =========================================================
