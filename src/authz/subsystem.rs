//! Dispatch of authorization requests to manager instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use log::{debug, info, trace, warn};
use super::manager::{AuthzDeps, AuthzManager, AuthzManagerConf, AuthzPlugin};
use super::token::{AuthContext, AuthzToken};
use crate::commons::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::commons::{Error, PkiEmptyResult, PkiResult};


//------------ ManagerInstance -----------------------------------------------

/// A configured manager and whether it is enabled.
struct ManagerInstance {
    conf: AuthzManagerConf,
    manager: Arc<dyn AuthzManager>,
}

type ManagerMap = HashMap<String, Arc<ManagerInstance>>;


//------------ AuthzSubsystem ------------------------------------------------

/// Routes authorization requests to named manager instances.
///
/// The set of instances is mostly read. Changes build a complete new map
/// and swap it in, so a reader always sees either the old or the new set.
pub struct AuthzSubsystem {
    plugins: HashMap<&'static str, AuthzPlugin>,
    managers: RwLock<Arc<ManagerMap>>,
    deps: AuthzDeps,
    audit: Arc<dyn AuditSink>,
}

impl AuthzSubsystem {
    /// Creates a subsystem knowing the built-in plugins.
    pub fn new(deps: AuthzDeps, audit: Arc<dyn AuditSink>) -> Self {
        AuthzSubsystem {
            plugins: AuthzPlugin::builtins().into_iter().map(|plugin| {
                (plugin.name, plugin)
            }).collect(),
            managers: RwLock::new(Arc::default()),
            deps,
            audit,
        }
    }

    /// Creates a subsystem and adds the given manager instances.
    pub fn build(
        deps: AuthzDeps,
        audit: Arc<dyn AuditSink>,
        confs: &[AuthzManagerConf],
    ) -> PkiResult<Self> {
        let res = Self::new(deps, audit);
        for conf in confs {
            res.add_manager(conf.clone())?;
        }
        Ok(res)
    }

    pub fn register_plugin(&mut self, plugin: AuthzPlugin) {
        self.plugins.insert(plugin.name, plugin);
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        let mut res: Vec<_> = self.plugins.keys().copied().collect();
        res.sort_unstable();
        res
    }

    fn snapshot(&self) -> Arc<ManagerMap> {
        self.managers.read().expect("poisoned lock").clone()
    }

    /// Applies a change to a copy of the manager map and swaps it in.
    fn update<F>(&self, op: F) -> PkiEmptyResult
    where F: FnOnce(&mut ManagerMap) -> PkiEmptyResult {
        let mut managers = self.managers.write().expect("poisoned lock");
        let mut new = managers.as_ref().clone();
        op(&mut new)?;
        *managers = Arc::new(new);
        Ok(())
    }

    /// Adds a manager instance, replacing one of the same name.
    ///
    /// Fails if the plugin is unknown or a realm of the new instance is
    /// already claimed by a different instance.
    pub fn add_manager(&self, conf: AuthzManagerConf) -> PkiEmptyResult {
        let plugin = self.plugins.get(conf.plugin.as_str()).ok_or_else(|| {
            Error::AuthzPluginUnknown(conf.plugin.clone())
        })?;
        let manager = (plugin.factory)(&conf, &self.deps)?;

        self.update(|map| {
            for realm in manager.realms() {
                if let Some(other) = map.values().find(|inst| {
                    inst.conf.name != conf.name && inst.manager.has_realm(realm)
                }) {
                    return Err(Error::custom(format!(
                        "Realm '{}' is claimed by both '{}' and '{}'",
                        realm, other.conf.name, conf.name
                    )))
                }
            }
            info!(
                "Authorization manager '{}' ({}) loaded, enabled={}",
                conf.name, conf.plugin, conf.enabled
            );
            map.insert(
                conf.name.clone(),
                Arc::new(ManagerInstance { conf, manager })
            );
            Ok(())
        })
    }

    /// Replaces a manager instance with a freshly created one.
    pub fn reload_manager(&self, conf: AuthzManagerConf) -> PkiEmptyResult {
        if !self.snapshot().contains_key(&conf.name) {
            return Err(Error::AuthzManagerNotFound(conf.name))
        }
        self.add_manager(conf)
    }

    /// Removes a manager instance.
    pub fn remove_manager(&self, name: &str) -> PkiEmptyResult {
        self.update(|map| {
            map.remove(name).map(|_| ()).ok_or_else(|| {
                Error::AuthzManagerNotFound(name.into())
            })
        })
    }

    /// Enables or disables a manager instance.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> PkiEmptyResult {
        self.update(|map| {
            let inst = map.get(name).ok_or_else(|| {
                Error::AuthzManagerNotFound(name.into())
            })?;
            let mut conf = inst.conf.clone();
            conf.enabled = enabled;
            let manager = inst.manager.clone();
            map.insert(
                name.into(), Arc::new(ManagerInstance { conf, manager })
            );
            Ok(())
        })
    }

    pub fn manager_names(&self) -> Vec<String> {
        let mut res: Vec<_> = self.snapshot().keys().cloned().collect();
        res.sort();
        res
    }

    /// Authorizes an operation through the named manager.
    ///
    /// If a realm is given, the resource is looked up as
    /// `<realm>.<resource>`. Exactly one audit event is emitted.
    pub fn authorize(
        &self,
        manager_name: &str,
        ctx: &AuthContext,
        resource: &str,
        operation: &str,
        realm: Option<&str>,
    ) -> PkiResult<AuthzToken> {
        let resource = match realm {
            Some(realm) => format!("{realm}.{resource}"),
            None => resource.to_string(),
        };
        trace!(
            "Authorizing '{}' on '{}' via '{}'",
            operation, resource, manager_name
        );

        let res = match self.snapshot().get(manager_name) {
            Some(inst) if inst.conf.enabled => {
                inst.manager.authorize(ctx, &resource, operation)
            }
            Some(_) => {
                debug!("Authorization manager '{manager_name}' is disabled");
                Err(Error::AuthzManagerNotFound(manager_name.into()))
            }
            None => Err(Error::AuthzManagerNotFound(manager_name.into())),
        };

        let event = match &res {
            Ok(_) => AuditEvent::success(AuditEventKind::Authz),
            Err(err) => {
                warn!("Authorization failed: {err}");
                AuditEvent::failure(AuditEventKind::Authz)
                    .with("Info", err)
            }
        };
        self.audit.log(
            event.with_subject(ctx.user_id())
                .with("Manager", manager_name)
                .with("Resource", &resource)
                .with("Operation", operation)
        );

        res
    }

    /// Checks access to a record in a realm.
    ///
    /// Succeeds right away without a realm or if the record belongs to the
    /// caller. Otherwise the realm is resolved to the manager claiming it
    /// and that manager decides.
    pub fn check_realm(
        &self,
        realm: Option<&str>,
        ctx: &AuthContext,
        owner: Option<&str>,
        resource: &str,
        operation: &str,
    ) -> PkiEmptyResult {
        let Some(realm) = realm else {
            return Ok(())
        };
        if let (Some(owner), Some(user_id)) = (owner, ctx.user_id()) {
            if owner == user_id {
                return Ok(())
            }
        }

        let manager_name = self.snapshot().values().find(|inst| {
            inst.manager.has_realm(realm)
        }).map(|inst| inst.conf.name.clone()).ok_or_else(|| {
            Error::UnknownRealm(realm.into())
        })?;

        self.authorize(
            &manager_name, ctx, resource, operation, Some(realm)
        ).map(|_| ()).map_err(|err| {
            match err {
                Error::AccessDenied { .. } => err,
                _ => Error::access_denied(ctx.user_id(), resource, operation),
            }
        })
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::acl::{AclComposition, AclStore};
    use crate::authz::evaluator::{EvaluatorRegistry, GroupEvaluator};
    use crate::authz::token::AuthToken;
    use crate::authz::users::MemoryUserGroups;
    use crate::commons::audit::MemoryAuditSink;
    use crate::constants::{AUTHZ_PLUGIN_ACL, AUTHZ_PLUGIN_GROUP};

    fn subsystem(audit: Arc<MemoryAuditSink>) -> AuthzSubsystem {
        let users = Arc::new(MemoryUserGroups::new());
        let deps = AuthzDeps {
            acls: Arc::new(AclStore::from_definitions(&[
                "certs:read:allow (read) group=\"Agents\"",
                "pki.users:read:allow (read) group=\"Admins\"",
            ], false).unwrap()),
            evaluators: Arc::new(EvaluatorRegistry::with_builtins(users.clone())),
            composition: AclComposition::All,
            groups: GroupEvaluator::new(users),
        };
        AuthzSubsystem::build(deps, audit, &[
            AuthzManagerConf::new("acl", AUTHZ_PLUGIN_ACL).with_realms("pki"),
            AuthzManagerConf::new("off", AUTHZ_PLUGIN_ACL).disabled(),
        ]).unwrap()
    }

    fn agent() -> AuthContext {
        AuthContext::new(
            AuthToken::for_user("alice").with_list(AuthToken::GROUPS, ["Agents"])
        )
    }

    #[test]
    fn disabled_manager_is_not_found() {
        let audit = Arc::new(MemoryAuditSink::new());
        let authz = subsystem(audit.clone());
        assert!(matches!(
            authz.authorize("off", &agent(), "certs", "read", None),
            Err(Error::AuthzManagerNotFound(_))
        ));
        assert!(matches!(
            authz.authorize("nope", &agent(), "certs", "read", None),
            Err(Error::AuthzManagerNotFound(_))
        ));
        assert_eq!(audit.len(), 2);

        authz.set_enabled("off", true).unwrap();
        assert!(authz.authorize("off", &agent(), "certs", "read", None).is_ok());
    }

    #[test]
    fn realm_prefixes_resource() {
        let audit = Arc::new(MemoryAuditSink::new());
        let authz = subsystem(audit.clone());
        let admin = AuthContext::new(
            AuthToken::for_user("root").with_list(AuthToken::GROUPS, ["Admins"])
        );
        assert!(authz.authorize("acl", &admin, "users", "read", Some("pki")).is_ok());
        assert!(authz.authorize("acl", &agent(), "users", "read", Some("pki")).is_err());

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_success());
        assert_eq!(events[0].attribute("Resource"), Some("pki.users"));
        assert!(!events[1].is_success());
    }

    #[test]
    fn check_realm_rules() {
        let audit = Arc::new(MemoryAuditSink::new());
        let authz = subsystem(audit.clone());

        assert!(authz.check_realm(None, &agent(), None, "users", "read").is_ok());
        assert!(authz.check_realm(
            Some("tps"), &agent(), Some("alice"), "users", "read"
        ).is_ok());
        assert_eq!(audit.len(), 0);

        assert!(matches!(
            authz.check_realm(Some("tps"), &agent(), Some("bob"), "users", "read"),
            Err(Error::UnknownRealm(_))
        ));
        assert!(matches!(
            authz.check_realm(Some("pki"), &agent(), Some("bob"), "users", "read"),
            Err(Error::AccessDenied { .. })
        ));
    }

    #[test]
    fn realms_are_exclusive() {
        let authz = subsystem(Arc::new(MemoryAuditSink::new()));
        let res = authz.add_manager(
            AuthzManagerConf::new("other", AUTHZ_PLUGIN_GROUP)
                .with_group("Admins").with_realms("pki")
        );
        assert!(res.is_err());
        assert_eq!(authz.manager_names(), ["acl", "off"]);

        // Reloading the owner itself is fine.
        authz.reload_manager(
            AuthzManagerConf::new("acl", AUTHZ_PLUGIN_GROUP)
                .with_group("Agents").with_realms("pki")
        ).unwrap();
        assert!(authz.authorize("acl", &agent(), "anything", "do", None).is_ok());
    }

    #[test]
    fn unknown_plugins_and_removal() {
        let authz = subsystem(Arc::new(MemoryAuditSink::new()));
        assert!(matches!(
            authz.add_manager(AuthzManagerConf::new("x", "DirAclAuthz")),
            Err(Error::AuthzPluginUnknown(_))
        ));
        authz.remove_manager("off").unwrap();
        assert!(authz.remove_manager("off").is_err());
        assert_eq!(authz.manager_names(), ["acl"]);
        assert_eq!(authz.plugin_names(), [AUTHZ_PLUGIN_ACL, AUTHZ_PLUGIN_GROUP]);
    }
}
