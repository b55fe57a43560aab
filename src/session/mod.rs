//! Security domain sessions.
//!
//! The session table records who opened which session from where. Entries
//! expire after the table's time-to-live and are reaped by the
//! [`SessionSweeper`].

pub mod directory;
pub mod memory;
pub mod sweeper;

pub use self::directory::DirectorySessionTable;
pub use self::memory::MemorySessionTable;
pub use self::sweeper::SessionSweeper;

use std::time::Duration;
use chrono::{DateTime, Utc};
use crate::commons::{PkiEmptyResult, PkiResult};


//------------ SessionEntry --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionEntry {
    pub session_id: String,
    pub ip: String,
    pub uid: String,
    pub group: String,
    pub begin_time: DateTime<Utc>,
}

impl SessionEntry {
    /// Creates an entry for a session beginning now.
    pub fn new(session_id: &str, ip: &str, uid: &str, group: &str) -> Self {
        SessionEntry {
            session_id: session_id.into(),
            ip: ip.into(),
            uid: uid.into(),
            group: group.into(),
            begin_time: Utc::now(),
        }
    }

    pub fn with_begin_time(mut self, begin_time: DateTime<Utc>) -> Self {
        self.begin_time = begin_time;
        self
    }
}


//------------ SessionTable --------------------------------------------------

/// The registry of open sessions.
///
/// Implementations may be used concurrently by request handlers and the
/// sweeper.
pub trait SessionTable: Send + Sync {
    /// Adds a session. Fails if a session with the same id exists.
    fn add(&self, entry: SessionEntry) -> PkiEmptyResult;

    /// Removes a session. Removing an unknown session does nothing.
    fn remove_entry(&self, session_id: &str) -> PkiEmptyResult;

    fn get(&self, session_id: &str) -> PkiResult<Option<SessionEntry>>;

    fn session_ids(&self) -> PkiResult<Vec<String>>;

    fn size(&self) -> PkiResult<usize>;

    /// The time after which a session expires.
    fn ttl(&self) -> Duration;

    fn add_entry(
        &self, session_id: &str, ip: &str, uid: &str, group: &str
    ) -> PkiEmptyResult {
        self.add(SessionEntry::new(session_id, ip, uid, group))
    }

    fn session_exists(&self, session_id: &str) -> PkiResult<bool> {
        Ok(self.get(session_id)?.is_some())
    }

    fn ip(&self, session_id: &str) -> PkiResult<Option<String>> {
        Ok(self.get(session_id)?.map(|entry| entry.ip))
    }

    fn uid(&self, session_id: &str) -> PkiResult<Option<String>> {
        Ok(self.get(session_id)?.map(|entry| entry.uid))
    }

    fn group(&self, session_id: &str) -> PkiResult<Option<String>> {
        Ok(self.get(session_id)?.map(|entry| entry.group))
    }

    fn begin_time(&self, session_id: &str) -> PkiResult<Option<DateTime<Utc>>> {
        Ok(self.get(session_id)?.map(|entry| entry.begin_time))
    }
}
