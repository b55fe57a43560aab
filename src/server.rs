//! The CA server tying all subsystems together.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use log::{info, warn};
use tokio::runtime;
use crate::authz::evaluator::{EvaluatorRegistry, GroupEvaluator};
use crate::authz::manager::AuthzDeps;
use crate::authz::users::{MemoryUserGroups, UserGroups};
use crate::authz::{AclStore, AuthContext, AuthzSubsystem, AuthzToken};
use crate::commons::audit::{AuditSink, LogAuditSink};
use crate::commons::{Error, PkiEmptyResult, PkiResult};
use crate::config::{Config, SessionStoreType};
use crate::constants::PKICA_SERVER_APP;
use crate::profile::{
    CaService, Certificate, KeyRecoveryController, KraConnector,
    MemoryRequestRepository, OpenSslIssuer, ProfileEngine, ProfileRegistry,
    Request, RequestRepository,
};
use crate::session::directory::DirectoryPool;
use crate::session::{
    DirectorySessionTable, MemorySessionTable, SessionSweeper, SessionTable,
};


//------------ Collaborators -------------------------------------------------

/// The external services a server talks to.
///
/// Everything left out falls back to a default: issuance from the
/// authorities in the config, audit events to the log, and requests kept
/// in memory. Without a KRA connector, key archival and server-side
/// keygen are refused. A directory pool is needed only when sessions are
/// kept in the directory.
#[derive(Default)]
pub struct Collaborators {
    pub kra: Option<Arc<dyn KraConnector>>,
    pub directory: Option<Arc<dyn DirectoryPool>>,
    pub ca: Option<Arc<dyn CaService>>,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub repository: Option<Arc<dyn RequestRepository>>,
    pub users: Option<Arc<dyn UserGroups>>,
}


//------------ CaServer ------------------------------------------------------

pub struct CaServer {
    config: Arc<Config>,
    authz: AuthzSubsystem,
    engine: ProfileEngine,
    sessions: Arc<dyn SessionTable>,
    audit: Arc<dyn AuditSink>,
    sweeper: Mutex<Option<SessionSweeper>>,
}

impl CaServer {
    /// Builds a server from a verified config.
    pub fn build(
        config: Arc<Config>, collaborators: Collaborators
    ) -> PkiResult<Self> {
        info!("Starting {PKICA_SERVER_APP} v{}", env!("CARGO_PKG_VERSION"));

        let Collaborators {
            kra, directory, ca, audit, repository, users
        } = collaborators;

        let audit: Arc<dyn AuditSink> = audit.unwrap_or_else(|| {
            Arc::new(LogAuditSink::new(config.audit_log_format()))
        });
        let repository: Arc<dyn RequestRepository> = repository.unwrap_or_else(|| {
            Arc::new(MemoryRequestRepository::new())
        });
        let users: Arc<dyn UserGroups> = users.unwrap_or_else(|| {
            Arc::new(MemoryUserGroups::from_conf(&config.users))
        });
        let ca: Arc<dyn CaService> = match ca {
            Some(ca) => ca,
            None => Arc::new(OpenSslIssuer::load(&config.authorities)?),
        };

        let acls = AclStore::from_definitions(&config.acls, config.acl.strict)?;
        info!("Loaded {} access control lists", acls.len());
        let deps = AuthzDeps {
            acls: Arc::new(acls),
            evaluators: Arc::new(EvaluatorRegistry::with_builtins(users.clone())),
            composition: config.acl.composition,
            groups: GroupEvaluator::new(users.clone()),
        };
        let authz = AuthzSubsystem::build(
            deps, audit.clone(), &config.authz_managers
        )?;

        let kra = if config.kra.enabled {
            if kra.is_none() {
                warn!("KRA enabled but no connector given, refusing key archival");
            }
            kra
        }
        else {
            None
        };
        let kra = KeyRecoveryController::new(
            kra,
            config.kra.timeout(),
            config.kra.invalid_transport_cert_message.as_str(),
            repository.clone(),
            audit.clone(),
        );

        let profiles = ProfileRegistry::from_conf(&config.profiles, &users)?;
        let engine = ProfileEngine::new(
            Arc::new(profiles), kra, ca, repository, audit.clone()
        );

        let sessions: Arc<dyn SessionTable> = match config.sessions.store {
            SessionStoreType::Memory => {
                Arc::new(MemorySessionTable::new(config.sessions.ttl()))
            }
            SessionStoreType::Directory => {
                let pool = directory.ok_or_else(|| {
                    Error::custom("Directory session store needs a directory")
                })?;
                let base_dn = config.sessions.base_dn.as_deref().ok_or_else(|| {
                    Error::custom("Directory session store needs a base_dn")
                })?;
                Arc::new(DirectorySessionTable::new(
                    pool, base_dn, config.sessions.ttl()
                )?)
            }
        };

        Ok(CaServer {
            config,
            authz,
            engine,
            sessions,
            audit,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authz(&self) -> &AuthzSubsystem {
        &self.authz
    }

    pub fn engine(&self) -> &ProfileEngine {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<dyn SessionTable> {
        &self.sessions
    }
}

/// # Enrollment
impl CaServer {
    /// Authorizes the caller for a profile and executes it.
    ///
    /// Profiles without authorization settings are open to anyone.
    pub fn enroll(
        &self, ctx: &AuthContext, profile_id: &str, req: &mut Request
    ) -> PkiResult<Certificate> {
        let profile = self.engine.profiles().get(profile_id)?;
        if let Some(authz) = profile.authz() {
            self.authz.authorize(
                &authz.manager, ctx, &authz.resource, &authz.operation,
                authz.realm.as_deref(),
            )?;
        }
        self.engine.execute(ctx, profile_id, req)
    }

    pub fn authorize(
        &self,
        manager: &str,
        ctx: &AuthContext,
        resource: &str,
        operation: &str,
    ) -> PkiResult<AuthzToken> {
        self.authz.authorize(manager, ctx, resource, operation, None)
    }

    pub fn check_realm(
        &self,
        realm: Option<&str>,
        ctx: &AuthContext,
        owner: Option<&str>,
        resource: &str,
        operation: &str,
    ) -> PkiEmptyResult {
        self.authz.check_realm(realm, ctx, owner, resource, operation)
    }
}

/// # Sessions
impl CaServer {
    pub fn open_session(
        &self, session_id: &str, ip: &str, uid: &str, group: &str
    ) -> PkiEmptyResult {
        self.sessions.add_entry(session_id, ip, uid, group)
    }

    pub fn close_session(&self, session_id: &str) -> PkiEmptyResult {
        self.sessions.remove_entry(session_id)
    }

    /// Starts sweeping expired sessions.
    ///
    /// Only one sweeper runs per server. Further calls do nothing.
    pub fn start_sweeper(&self, runtime: &runtime::Handle) {
        let mut sweeper = self.sweeper();
        if sweeper.is_some() {
            return
        }
        let interval = self.config.sessions.sweep_interval();
        info!("Sweeping expired sessions every {}s", interval.as_secs());
        *sweeper = Some(SessionSweeper::spawn(
            &self.sessions, self.audit.clone(), interval, runtime
        ));
    }

    /// Stops the sweeper if it runs.
    pub fn stop_sweeper(&self) {
        self.sweeper().take();
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper().as_ref().is_some_and(|s| !s.is_finished())
    }

    /// Locks the sweeper slot, recovering it from a poisoned lock.
    fn sweeper(&self) -> MutexGuard<'_, Option<SessionSweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


//============ Tests =========================================================
