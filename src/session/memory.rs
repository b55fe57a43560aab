//! A session table living in memory.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use log::debug;
use super::{SessionEntry, SessionTable};
use crate::commons::{Error, PkiEmptyResult, PkiResult};


//------------ MemorySessionTable --------------------------------------------

/// Keeps sessions for the lifetime of the process.
#[derive(Debug)]
pub struct MemorySessionTable {
    entries: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl MemorySessionTable {
    pub fn new(ttl: Duration) -> Self {
        MemorySessionTable {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

impl SessionTable for MemorySessionTable {
    fn add(&self, entry: SessionEntry) -> PkiEmptyResult {
        let mut entries = self.entries.write().expect("poisoned lock");
        if entries.contains_key(&entry.session_id) {
            return Err(Error::custom(format!(
                "Session '{}' already exists", entry.session_id
            )))
        }
        debug!("Added session '{}' for '{}'", entry.session_id, entry.uid);
        entries.insert(entry.session_id.clone(), entry);
        Ok(())
    }

    fn remove_entry(&self, session_id: &str) -> PkiEmptyResult {
        if self.entries.write().expect("poisoned lock").remove(
            session_id
        ).is_some() {
            debug!("Removed session '{session_id}'");
        }
        Ok(())
    }

    fn get(&self, session_id: &str) -> PkiResult<Option<SessionEntry>> {
        Ok(self.entries.read().expect("poisoned lock").get(session_id).cloned())
    }

    fn session_ids(&self) -> PkiResult<Vec<String>> {
        Ok(self.entries.read().expect("poisoned lock").keys().cloned().collect())
    }

    fn size(&self) -> PkiResult<usize> {
        Ok(self.entries.read().expect("poisoned lock").len())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}


//============ Tests =========================================================
