//! Authorization managers and the plugins that create them.

use std::fmt;
use std::sync::Arc;
use log::{debug, warn};
use serde::Deserialize;
use super::acl::{AclComposition, AclStore};
use super::evaluator::{EvaluatorRegistry, GroupEvaluator};
use super::token::{AuthContext, AuthzToken};
use crate::commons::{Error, PkiResult};
use crate::constants::{AUTHZ_PLUGIN_ACL, AUTHZ_PLUGIN_GROUP};


//------------ AuthzManager --------------------------------------------------

/// Decides whether a caller may perform an operation on a resource.
pub trait AuthzManager: Send + Sync {
    /// The instance name of the manager.
    fn name(&self) -> &str;

    /// The name of the plugin the manager was created from.
    fn plugin(&self) -> &'static str;

    /// The realms this manager is responsible for.
    fn realms(&self) -> &[String];

    /// Authorizes the operation or returns [`Error::AccessDenied`].
    fn authorize(
        &self, ctx: &AuthContext, resource: &str, operation: &str
    ) -> PkiResult<AuthzToken>;

    /// Returns whether the manager claims the given realm.
    fn has_realm(&self, realm: &str) -> bool {
        self.realms().iter().any(|item| item == realm)
    }
}


//------------ AuthzManagerConf ----------------------------------------------

/// The configuration of an authorization manager instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AuthzManagerConf {
    pub name: String,

    pub plugin: String,

    #[serde(default = "AuthzManagerConf::default_enabled")]
    pub enabled: bool,

    /// A comma separated list of realms.
    #[serde(default)]
    pub realms: String,

    /// The group required by the group plugin.
    #[serde(default)]
    pub group: Option<String>,
}

impl AuthzManagerConf {
    fn default_enabled() -> bool {
        true
    }

    pub fn new(name: &str, plugin: &str) -> Self {
        AuthzManagerConf {
            name: name.into(),
            plugin: plugin.into(),
            enabled: true,
            realms: String::new(),
            group: None,
        }
    }

    pub fn with_realms(mut self, realms: &str) -> Self {
        self.realms = realms.into();
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the parsed realm list.
    pub fn realm_list(&self) -> Vec<String> {
        self.realms.split(',').map(str::trim).filter(|s| {
            !s.is_empty()
        }).map(ToString::to_string).collect()
    }
}


//------------ AuthzDeps -----------------------------------------------------

/// What plugins may use when creating a manager.
#[derive(Clone, Debug)]
pub struct AuthzDeps {
    pub acls: Arc<AclStore>,
    pub evaluators: Arc<EvaluatorRegistry>,
    pub composition: AclComposition,
    pub groups: GroupEvaluator,
}


//------------ AuthzPlugin ---------------------------------------------------

/// The constructor for managers of one plugin.
pub type AuthzFactory = fn(
    &AuthzManagerConf, &AuthzDeps
) -> PkiResult<Arc<dyn AuthzManager>>;

/// A plugin that can create authorization managers.
#[derive(Clone, Copy)]
pub struct AuthzPlugin {
    pub name: &'static str,
    pub description: &'static str,
    pub factory: AuthzFactory,
}

impl AuthzPlugin {
    /// Returns the plugins compiled into the server.
    pub fn builtins() -> [AuthzPlugin; 2] {
        [
            AuthzPlugin {
                name: AUTHZ_PLUGIN_ACL,
                description: "ACL based authorization",
                factory: AclAuthz::create,
            },
            AuthzPlugin {
                name: AUTHZ_PLUGIN_GROUP,
                description: "Group membership based authorization",
                factory: GroupAuthz::create,
            },
        ]
    }
}

impl fmt::Debug for AuthzPlugin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthzPlugin")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}


//------------ AclAuthz ------------------------------------------------------

/// Authorizes through the ACL of the requested resource.
#[derive(Debug)]
pub struct AclAuthz {
    name: String,
    realms: Vec<String>,
    acls: Arc<AclStore>,
    evaluators: Arc<EvaluatorRegistry>,
    composition: AclComposition,
}

impl AclAuthz {
    fn create(
        conf: &AuthzManagerConf, deps: &AuthzDeps
    ) -> PkiResult<Arc<dyn AuthzManager>> {
        Ok(Arc::new(AclAuthz {
            name: conf.name.clone(),
            realms: conf.realm_list(),
            acls: deps.acls.clone(),
            evaluators: deps.evaluators.clone(),
            composition: deps.composition,
        }))
    }
}

impl AuthzManager for AclAuthz {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin(&self) -> &'static str {
        AUTHZ_PLUGIN_ACL
    }

    fn realms(&self) -> &[String] {
        &self.realms
    }

    fn authorize(
        &self, ctx: &AuthContext, resource: &str, operation: &str
    ) -> PkiResult<AuthzToken> {
        let Some(acl) = self.acls.get(resource) else {
            warn!("No ACL for resource '{resource}', denying access");
            return Err(Error::access_denied(ctx.user_id(), resource, operation))
        };

        if acl.check_permission(
            ctx, operation, &self.evaluators, self.composition
        ) {
            Ok(AuthzToken::grant(&self.name, resource, operation, ctx))
        }
        else {
            Err(Error::access_denied(ctx.user_id(), resource, operation))
        }
    }
}


//------------ GroupAuthz ----------------------------------------------------

/// Grants everything to members of one group.
#[derive(Debug)]
pub struct GroupAuthz {
    name: String,
    realms: Vec<String>,
    group: String,
    evaluator: GroupEvaluator,
}

impl GroupAuthz {
    fn create(
        conf: &AuthzManagerConf, deps: &AuthzDeps
    ) -> PkiResult<Arc<dyn AuthzManager>> {
        let Some(group) = conf.group.clone() else {
            return Err(Error::custom(format!(
                "Authorization manager '{}' requires a 'group'", conf.name
            )))
        };
        Ok(Arc::new(GroupAuthz {
            name: conf.name.clone(),
            realms: conf.realm_list(),
            group,
            evaluator: deps.groups.clone(),
        }))
    }
}

impl AuthzManager for GroupAuthz {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin(&self) -> &'static str {
        AUTHZ_PLUGIN_GROUP
    }

    fn realms(&self) -> &[String] {
        &self.realms
    }

    fn authorize(
        &self, ctx: &AuthContext, resource: &str, operation: &str
    ) -> PkiResult<AuthzToken> {
        if self.evaluator.is_member(ctx, &self.group) == Some(true) {
            Ok(AuthzToken::grant(&self.name, resource, operation, ctx))
        }
        else {
            debug!(
                "'{}' is not a member of '{}'",
                ctx.user_id().unwrap_or("anonymous"), self.group
            );
            Err(Error::access_denied(ctx.user_id(), resource, operation))
        }
    }
}


//============ Tests =========================================================
