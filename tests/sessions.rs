//! Security domain sessions and their expiry.

use std::time::Duration;
use chrono::Utc;
use pkica::commons::audit::AuditEventKind;
use pkica::session::{SessionEntry, SessionTable};
use pkica::session::sweeper::sweep;

mod common;

use common::{TestKra, TestServer};


const SHORT_SESSIONS: &str = "
[sessions]
ttl_secs = 60
sweep_interval_secs = 1
";

#[test]
fn open_and_close_sessions() {
    let test = TestServer::start(Some(TestKra::ok()), SHORT_SESSIONS);
    let sessions = test.server.sessions();

    test.server.open_session("s-1", "192.0.2.1", "alice", "Agents").unwrap();
    assert!(test.server.open_session("s-1", "192.0.2.9", "eve", "Agents").is_err());
    assert_eq!(sessions.uid("s-1").unwrap().as_deref(), Some("alice"));
    assert_eq!(sessions.size().unwrap(), 1);

    test.server.close_session("s-1").unwrap();
    test.server.close_session("s-1").unwrap();
    assert!(!sessions.session_exists("s-1").unwrap());
}

#[test]
fn sweep_honours_ttl() {
    let test = TestServer::start(Some(TestKra::ok()), SHORT_SESSIONS);
    let sessions = test.server.sessions();
    let now = Utc::now();

    sessions.add(
        SessionEntry::new("expired", "192.0.2.1", "alice", "Agents")
            .with_begin_time(now - chrono::Duration::seconds(61))
    ).unwrap();
    sessions.add(
        SessionEntry::new("fresh", "192.0.2.2", "bob", "Agents")
            .with_begin_time(now - chrono::Duration::seconds(59))
    ).unwrap();

    assert_eq!(sweep(sessions.as_ref(), test.audit.as_ref(), now).unwrap(), 1);
    assert!(!sessions.session_exists("expired").unwrap());
    assert!(sessions.session_exists("fresh").unwrap());

    let events = test.audit.events_of(
        AuditEventKind::SecurityDomainSessionTimeout
    );
    assert_eq!(events.len(), 1);
    assert!(events[0].is_success());
    assert_eq!(events[0].attribute("SessionID"), Some("expired"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sweeper_reaps_in_background() {
    let test = TestServer::start(Some(TestKra::ok()), SHORT_SESSIONS);
    let sessions = test.server.sessions().clone();
    sessions.add(
        SessionEntry::new("expired", "192.0.2.1", "alice", "Agents")
            .with_begin_time(Utc::now() - chrono::Duration::seconds(120))
    ).unwrap();

    let runtime = tokio::runtime::Handle::current();
    test.server.start_sweeper(&runtime);
    test.server.start_sweeper(&runtime);
    assert!(test.server.sweeper_running());

    for _ in 0..50 {
        if !sessions.session_exists("expired").unwrap() {
            break
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!sessions.session_exists("expired").unwrap());
    assert_eq!(
        test.audit.events_of(AuditEventKind::SecurityDomainSessionTimeout).len(),
        1
    );

    test.server.stop_sweeper();
    assert!(!test.server.sweeper_running());
}
