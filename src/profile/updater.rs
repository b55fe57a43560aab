//! Post-issuance updaters.

use std::sync::Arc;
use log::info;
use serde::Deserialize;
use super::request::Request;
use crate::authz::AuthContext;
use crate::authz::users::UserGroups;
use crate::commons::{Error, PkiEmptyResult};


//------------ ProfileUpdater ------------------------------------------------

/// Acts on a completed request.
///
/// Updaters run after the certificate was issued. A failing updater does not
/// undo the issuance.
pub trait ProfileUpdater: Send + Sync {
    fn name(&self) -> &str;

    fn update(&self, ctx: &AuthContext, req: &Request) -> PkiEmptyResult;
}


//------------ UpdaterConf ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdaterConf {
    SubsystemGroup {
        group: String,
    },
}

impl UpdaterConf {
    pub fn build(&self, users: &Arc<dyn UserGroups>) -> Box<dyn ProfileUpdater> {
        match self {
            UpdaterConf::SubsystemGroup { group } => {
                Box::new(SubsystemGroupUpdater::new(group, users.clone()))
            }
        }
    }
}


//------------ SubsystemGroupUpdater -----------------------------------------

/// Adds the requester to a group.
pub struct SubsystemGroupUpdater {
    group: String,
    users: Arc<dyn UserGroups>,
}

impl SubsystemGroupUpdater {
    pub fn new(group: &str, users: Arc<dyn UserGroups>) -> Self {
        SubsystemGroupUpdater { group: group.into(), users }
    }
}

impl ProfileUpdater for SubsystemGroupUpdater {
    fn name(&self) -> &str {
        "subsystem_group"
    }

    fn update(&self, ctx: &AuthContext, req: &Request) -> PkiEmptyResult {
        let uid = ctx.user_id().ok_or_else(|| {
            Error::custom(format!(
                "Request {} has no requester to add to '{}'",
                req.id(), self.group
            ))
        })?;
        self.users.add_member(&self.group, uid)?;
        info!("Added '{}' to group '{}' for request {}", uid, self.group, req.id());
        Ok(())
    }
}


//============ Tests =========================================================
