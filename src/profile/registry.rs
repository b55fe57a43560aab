//! Profiles and the registry holding them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use log::info;
use serde::Deserialize;
use super::input::{InputConf, ProfileInput};
use super::output::{OutputConf, ProfileOutput};
use super::policy::{Policy, PolicyConf};
use super::updater::{ProfileUpdater, UpdaterConf};
use crate::authz::users::UserGroups;
use crate::commons::{Error, PkiResult};


//------------ ProfileConf ---------------------------------------------------

/// A profile as defined in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct ProfileConf {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "ProfileConf::default_enabled")]
    pub enabled: bool,

    /// The authority issuing certificates for this profile.
    pub authority: String,

    #[serde(default)]
    pub authz: Option<ProfileAuthzConf>,

    #[serde(default)]
    pub inputs: Vec<InputConf>,

    #[serde(default)]
    pub policies: Vec<PolicyConf>,

    #[serde(default)]
    pub outputs: Vec<OutputConf>,

    #[serde(default)]
    pub updaters: Vec<UpdaterConf>,
}

impl ProfileConf {
    fn default_enabled() -> bool {
        true
    }
}


//------------ ProfileAuthzConf ----------------------------------------------

/// How enrollments through a profile are authorized.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ProfileAuthzConf {
    pub manager: String,

    pub resource: String,

    #[serde(default = "ProfileAuthzConf::default_operation")]
    pub operation: String,

    #[serde(default)]
    pub realm: Option<String>,
}

impl ProfileAuthzConf {
    fn default_operation() -> String {
        "submit".into()
    }
}


//------------ Profile -------------------------------------------------------

/// A named chain of stages a request passes through.
pub struct Profile {
    id: String,
    name: String,
    enabled: AtomicBool,
    authority: String,
    authz: Option<ProfileAuthzConf>,
    inputs: Vec<Box<dyn ProfileInput>>,
    policies: Vec<Policy>,
    outputs: Vec<Box<dyn ProfileOutput>>,
    updaters: Vec<Box<dyn ProfileUpdater>>,
}

impl Profile {
    /// Creates an enabled profile without any stages.
    pub fn new(id: &str, authority: &str) -> Self {
        Profile {
            id: id.into(),
            name: id.into(),
            enabled: AtomicBool::new(true),
            authority: authority.into(),
            authz: None,
            inputs: Vec::new(),
            policies: Vec::new(),
            outputs: Vec::new(),
            updaters: Vec::new(),
        }
    }

    pub fn from_conf(
        conf: &ProfileConf, users: &Arc<dyn UserGroups>
    ) -> PkiResult<Self> {
        let policies = conf.policies.iter().map(|policy| {
            policy.build()
        }).collect::<PkiResult<Vec<_>>>().map_err(|err| {
            Error::custom(format!("Profile '{}': {}", conf.id, err))
        })?;
        Ok(Profile {
            id: conf.id.clone(),
            name: if conf.name.is_empty() {
                conf.id.clone()
            }
            else {
                conf.name.clone()
            },
            enabled: AtomicBool::new(conf.enabled),
            authority: conf.authority.clone(),
            authz: conf.authz.clone(),
            inputs: conf.inputs.iter().map(InputConf::build).collect(),
            policies,
            outputs: conf.outputs.iter().map(OutputConf::build).collect(),
            updaters: conf.updaters.iter().map(|updater| {
                updater.build(users)
            }).collect(),
        })
    }

    pub fn with_input(mut self, input: impl ProfileInput + 'static) -> Self {
        self.inputs.push(Box::new(input));
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_output(mut self, output: impl ProfileOutput + 'static) -> Self {
        self.outputs.push(Box::new(output));
        self
    }

    pub fn with_updater(
        mut self, updater: impl ProfileUpdater + 'static
    ) -> Self {
        self.updaters.push(Box::new(updater));
        self
    }

    pub fn with_authz(mut self, authz: ProfileAuthzConf) -> Self {
        self.authz = Some(authz);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release)
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn authz(&self) -> Option<&ProfileAuthzConf> {
        self.authz.as_ref()
    }

    pub fn inputs(&self) -> &[Box<dyn ProfileInput>] {
        &self.inputs
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn outputs(&self) -> &[Box<dyn ProfileOutput>] {
        &self.outputs
    }

    pub fn updaters(&self) -> &[Box<dyn ProfileUpdater>] {
        &self.updaters
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Profile")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("authority", &self.authority)
            .field("inputs", &self.inputs.iter().map(|i| i.name()).collect::<Vec<_>>())
            .field("policies", &self.policies.iter().map(|p| {
                (p.default.name(), p.constraint.name())
            }).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(|o| o.name()).collect::<Vec<_>>())
            .field("updaters", &self.updaters.iter().map(|u| u.name()).collect::<Vec<_>>())
            .finish()
    }
}


//------------ ProfileRegistry -----------------------------------------------

#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, Arc<Profile>>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conf(
        confs: &[ProfileConf], users: &Arc<dyn UserGroups>
    ) -> PkiResult<Self> {
        let res = Self::new();
        for conf in confs {
            res.add(Profile::from_conf(conf, users)?);
        }
        Ok(res)
    }

    /// Adds a profile, replacing one with the same id.
    pub fn add(&self, profile: Profile) {
        info!(
            "Profile '{}' loaded, enabled={}", profile.id(), profile.is_enabled()
        );
        self.profiles.write().expect("poisoned lock").insert(
            profile.id().into(), Arc::new(profile)
        );
    }

    pub fn get(&self, id: &str) -> PkiResult<Arc<Profile>> {
        self.profiles.read().expect("poisoned lock").get(id).cloned()
            .ok_or_else(|| Error::ProfileUnknown(id.into()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut res: Vec<_> = self.profiles.read().expect(
            "poisoned lock"
        ).keys().cloned().collect();
        res.sort();
        res
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::users::MemoryUserGroups;

    #[test]
    fn profile_from_toml() {
        let conf: ProfileConf = toml::from_str(r#"
            id = "caUserCert"
            authority = "ca1"

            [authz]
            manager = "certUserAuthz"
            resource = "certServer.ee.profile"

            [[inputs]]
            type = "subject_name"

            [[inputs]]
            type = "key"

            [[policies]]
            default = { type = "validity", range_days = 180 }
            constraint = { type = "validity", max_days = 365 }

            [[policies]]
            constraint = { type = "key", algorithms = ["rsa"], min_rsa_size = 2048 }

            [[outputs]]
            type = "cert_pem"

            [[updaters]]
            type = "subsystem_group"
            group = "Subsystem Group"
        "#).unwrap();
        assert!(conf.enabled);
        assert_eq!(conf.authz.as_ref().unwrap().operation, "submit");

        let users: Arc<dyn UserGroups> = Arc::new(MemoryUserGroups::new());
        let profile = Profile::from_conf(&conf, &users).unwrap();
        assert_eq!(profile.name(), "caUserCert");
        assert_eq!(profile.inputs().len(), 2);
        assert_eq!(profile.policies().len(), 2);
        assert_eq!(profile.policies()[1].default.name(), "none");
        assert_eq!(profile.updaters().len(), 1);
    }

    #[test]
    fn bad_policy_fails_profile() {
        let conf: ProfileConf = toml::from_str(r#"
            id = "broken"
            authority = "ca1"

            [[policies]]
            constraint = { type = "subject_name", pattern = "(" }
        "#).unwrap();
        let users: Arc<dyn UserGroups> = Arc::new(MemoryUserGroups::new());
        assert!(Profile::from_conf(&conf, &users).is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = ProfileRegistry::new();
        registry.add(Profile::new("p1", "ca1"));
        assert!(registry.get("p1").is_ok());
        assert!(matches!(registry.get("p2"), Err(Error::ProfileUnknown(_))));
        registry.get("p1").unwrap().set_enabled(false);
        assert!(!registry.get("p1").unwrap().is_enabled());
        assert_eq!(registry.ids(), ["p1"]);
    }
}
