//! The user and group directory consulted by authorization.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use log::debug;
use serde::Deserialize;
use crate::commons::PkiResult;


//------------ User ----------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct User {
    pub uid: String,
    pub groups: BTreeSet<String>,
}


//------------ UserGroups ----------------------------------------------------

/// Access to users and their group memberships.
pub trait UserGroups: Send + Sync {
    /// Returns the user with the given uid if it exists.
    fn get_user(&self, uid: &str) -> PkiResult<Option<User>>;

    /// Returns whether the user is a member of the group.
    fn is_member_of(&self, user: &User, group: &str) -> PkiResult<bool>;

    /// Adds the user to the group, creating the user if needed.
    fn add_member(&self, group: &str, uid: &str) -> PkiResult<()>;
}


//------------ UserConf ------------------------------------------------------

/// A user as defined in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct UserConf {
    pub uid: String,

    #[serde(default)]
    pub groups: Vec<String>,
}


//------------ MemoryUserGroups ----------------------------------------------

/// A user and group directory held in memory.
#[derive(Debug, Default)]
pub struct MemoryUserGroups {
    users: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryUserGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conf(users: &[UserConf]) -> Self {
        MemoryUserGroups {
            users: RwLock::new(
                users.iter().map(|user| {
                    (user.uid.clone(), user.groups.iter().cloned().collect())
                }).collect()
            )
        }
    }
}

impl UserGroups for MemoryUserGroups {
    fn get_user(&self, uid: &str) -> PkiResult<Option<User>> {
        let users = self.users.read().expect("poisoned lock");
        Ok(users.get(uid).map(|groups| {
            User { uid: uid.into(), groups: groups.clone() }
        }))
    }

    fn is_member_of(&self, user: &User, group: &str) -> PkiResult<bool> {
        let users = self.users.read().expect("poisoned lock");
        Ok(users.get(&user.uid).is_some_and(|groups| groups.contains(group)))
    }

    fn add_member(&self, group: &str, uid: &str) -> PkiResult<()> {
        debug!("Adding user '{uid}' to group '{group}'");
        self.users.write().expect("poisoned lock")
            .entry(uid.into()).or_default()
            .insert(group.into());
        Ok(())
    }
}


//============ Tests =========================================================
