//! Authorization through managers, ACLs and realms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use pkica::authz::evaluator::{EvaluatorRegistry, GroupEvaluator};
use pkica::authz::manager::{AuthzDeps, AuthzPlugin};
use pkica::authz::users::MemoryUserGroups;
use pkica::authz::{
    AclComposition, AclStore, AuthContext, AuthToken, AuthzManager,
    AuthzManagerConf, AuthzSubsystem, AuthzToken,
};
use pkica::commons::audit::{AuditEventKind, MemoryAuditSink};
use pkica::commons::{Error, PkiResult};

mod common;

use common::{TestKra, TestServer};


fn user(uid: &str) -> AuthContext {
    AuthContext::new(AuthToken::for_user(uid))
}


//------------ Through the server --------------------------------------------

#[test]
fn deny_entry_wins_over_allow() {
    let test = TestServer::start(Some(TestKra::ok()), "");

    let token = test.server.authorize(
        "DirAclAuthz", &user("alice"), "certServer.ca.certs", "revoke"
    ).unwrap();
    assert_eq!(token.user_id(), Some("alice"));
    assert_eq!(token.manager(), "DirAclAuthz");

    // Mallory is in the group the allow entry names, but also denied.
    let err = test.server.authorize(
        "DirAclAuthz", &user("mallory"), "certServer.ca.certs", "revoke"
    ).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
    test.server.authorize(
        "DirAclAuthz", &user("mallory"), "certServer.ca.certs", "read"
    ).unwrap();

    let events = test.audit.events_of(AuditEventKind::Authz);
    assert_eq!(events.len(), 3);
    assert_eq!(events.iter().filter(|e| e.is_success()).count(), 2);
}

#[test]
fn resource_without_acl_is_denied() {
    let test = TestServer::start(Some(TestKra::ok()), "");
    let err = test.server.authorize(
        "DirAclAuthz", &user("alice"), "certServer.kra.keys", "read"
    ).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
}

#[test]
fn owner_bypasses_realm_check() {
    let test = TestServer::start(Some(TestKra::ok()), "");

    // Nobody has an ACL for this resource, but the owner gets in anyway.
    test.server.check_realm(
        Some("dept1"), &user("bob"), Some("bob"), "certServer.kra.keys", "read"
    ).unwrap();
    test.server.check_realm(
        Some("nowhere"), &user("bob"), Some("bob"), "anything", "read"
    ).unwrap();

    let err = test.server.check_realm(
        Some("dept1"), &user("bob"), Some("carol"), "certServer.kra.keys", "read"
    ).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
}

#[test]
fn realm_check_without_realm_passes() {
    let test = TestServer::start(Some(TestKra::ok()), "");
    test.server.check_realm(
        None, &AuthContext::anonymous(), None, "anything", "read"
    ).unwrap();
}

#[test]
fn unknown_realm_is_an_error() {
    let test = TestServer::start(Some(TestKra::ok()), "");
    let err = test.server.check_realm(
        Some("dept9"), &user("bob"), Some("carol"), "res", "read"
    ).unwrap_err();
    assert!(matches!(err, Error::UnknownRealm(_)));
}


//------------ Subsystem -----------------------------------------------------

static CALLS: AtomicUsize = AtomicUsize::new(0);

/// A manager counting how often it is asked.
struct CountingAuthz {
    name: String,
    realms: Vec<String>,
}

impl CountingAuthz {
    fn create(
        conf: &AuthzManagerConf, _deps: &AuthzDeps
    ) -> PkiResult<Arc<dyn AuthzManager>> {
        Ok(Arc::new(CountingAuthz {
            name: conf.name.clone(),
            realms: conf.realm_list(),
        }))
    }
}

impl AuthzManager for CountingAuthz {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin(&self) -> &'static str {
        "CountingAuthz"
    }

    fn realms(&self) -> &[String] {
        &self.realms
    }

    fn authorize(
        &self, ctx: &AuthContext, resource: &str, operation: &str
    ) -> PkiResult<AuthzToken> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Err(Error::access_denied(ctx.user_id(), resource, operation))
    }
}

fn subsystem(audit: Arc<MemoryAuditSink>) -> AuthzSubsystem {
    let users = Arc::new(MemoryUserGroups::new());
    let deps = AuthzDeps {
        acls: Arc::new(AclStore::new()),
        evaluators: Arc::new(EvaluatorRegistry::with_builtins(users.clone())),
        composition: AclComposition::All,
        groups: GroupEvaluator::new(users),
    };
    let mut res = AuthzSubsystem::new(deps, audit);
    res.register_plugin(AuthzPlugin {
        name: "CountingAuthz",
        description: "Counts authorization calls",
        factory: CountingAuthz::create,
    });
    res
}

#[test]
fn disabled_manager_is_not_consulted() {
    let audit = Arc::new(MemoryAuditSink::new());
    let authz = subsystem(audit.clone());
    authz.add_manager(
        AuthzManagerConf::new("mgrA", "CountingAuthz").disabled()
    ).unwrap();

    let before = CALLS.load(Ordering::SeqCst);
    let err = authz.authorize(
        "mgrA", &user("alice"), "res.read", "op", None
    ).unwrap_err();
    assert!(matches!(err, Error::AuthzManagerNotFound(_)));
    assert_eq!(CALLS.load(Ordering::SeqCst), before);

    let events = audit.events_of(AuditEventKind::Authz);
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_success());
}

#[test]
fn managers_can_be_swapped_at_runtime() {
    let audit = Arc::new(MemoryAuditSink::new());
    let authz = subsystem(audit);
    authz.add_manager(
        AuthzManagerConf::new("mgrA", "CountingAuthz").with_realms("east")
    ).unwrap();

    // A second manager may not claim the same realm.
    assert!(authz.add_manager(
        AuthzManagerConf::new("mgrB", "CountingAuthz").with_realms("east")
    ).is_err());
    assert_eq!(authz.manager_names(), ["mgrA"]);

    authz.reload_manager(
        AuthzManagerConf::new("mgrA", "CountingAuthz").with_realms("west")
    ).unwrap();
    authz.add_manager(
        AuthzManagerConf::new("mgrB", "CountingAuthz").with_realms("east")
    ).unwrap();
    assert_eq!(authz.manager_names(), ["mgrA", "mgrB"]);

    authz.remove_manager("mgrA").unwrap();
    assert!(matches!(
        authz.remove_manager("mgrA"),
        Err(Error::AuthzManagerNotFound(_))
    ));
    assert!(matches!(
        authz.add_manager(AuthzManagerConf::new("mgrC", "NoSuchPlugin")),
        Err(Error::AuthzPluginUnknown(_))
    ));
}
