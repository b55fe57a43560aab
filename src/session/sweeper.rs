//! Removing expired sessions.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::runtime;
use tokio::task::JoinHandle;
use super::SessionTable;
use crate::commons::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::commons::{Error, PkiResult};


/// Runs a single sweep over the table.
///
/// Removes every session older than the table's time-to-live and returns
/// the number of sessions removed. Every removal attempt is audited. If
/// any removal fails, the others are still attempted and an error
/// listing the failures is returned.
pub fn sweep(
    table: &dyn SessionTable, audit: &dyn AuditSink, now: DateTime<Utc>,
) -> PkiResult<usize> {
    let ttl = table.ttl();
    let mut removed = 0;
    let mut failures = Vec::new();

    for session_id in table.session_ids()? {
        // Gone between listing and reading is fine.
        let entry = match table.get(&session_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(err) => {
                failures.push(format!("{session_id}: {err}"));
                continue
            }
        };
        let expired = (now - entry.begin_time).to_std().is_ok_and(|age| {
            age > ttl
        });
        if !expired {
            continue
        }

        let event = match table.remove_entry(&session_id) {
            Ok(()) => {
                removed += 1;
                AuditEvent::success(AuditEventKind::SecurityDomainSessionTimeout)
            }
            Err(err) => {
                failures.push(format!("{session_id}: {err}"));
                AuditEvent::failure(AuditEventKind::SecurityDomainSessionTimeout)
                    .with("Info", err)
            }
        };
        audit.log(
            event.with_subject(Some(entry.uid.as_str()))
                .with("SessionID", &session_id)
                .with("ClientIP", &entry.ip)
        );
    }

    if failures.is_empty() {
        Ok(removed)
    }
    else {
        Err(Error::SessionSweep(failures))
    }
}


//------------ SessionSweeper ------------------------------------------------

/// A background task regularly sweeping a session table.
///
/// The task holds only a weak reference to the table and ends once the
/// table is gone. It is also stopped when the sweeper is dropped.
#[derive(Debug)]
pub struct SessionSweeper {
    handle: JoinHandle<()>,
}

impl SessionSweeper {
    /// Spawns the sweeper onto the given runtime.
    ///
    /// Sweeps happen `interval` apart, the first one after a full interval.
    /// A sweep runs to completion before the next wait begins, so sweeps
    /// never overlap.
    pub fn spawn(
        table: &Arc<dyn SessionTable>,
        audit: Arc<dyn AuditSink>,
        interval: Duration,
        runtime: &runtime::Handle,
    ) -> Self {
        let table_weak = Arc::downgrade(table);
        let handle = runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(table) = table_weak.upgrade() else {
                    debug!("Session table dropped, stopping sweeper");
                    break;
                };

                let audit = audit.clone();
                let res = tokio::task::spawn_blocking(move || {
                    sweep(table.as_ref(), audit.as_ref(), Utc::now())
                }).await;

                match res {
                    Ok(Ok(0)) => { }
                    Ok(Ok(removed)) => {
                        info!("Session sweep removed {removed} expired sessions")
                    }
                    Ok(Err(err)) => error!("Session sweep failed: {err}"),
                    Err(err) => error!("Session sweep aborted: {err}"),
                }
            }
        });
        SessionSweeper { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.handle.abort()
    }
}


//============ Tests =========================================================
