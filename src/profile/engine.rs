//! Executing a profile for a request.

use std::sync::Arc;
use log::{debug, info, warn};
use super::certinfo::SubjectKey;
use super::issuance::{CaService, Certificate, log_issued};
use super::keyrecovery::KeyRecoveryController;
use super::registry::{Profile, ProfileRegistry};
use super::repository::RequestRepository;
use super::request::{Request, RequestStatus, RequestType};
use crate::authz::AuthContext;
use crate::commons::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::commons::{Error, PkiEmptyResult, PkiResult};


//------------ ProfileEngine -------------------------------------------------

/// Walks requests through their profile up to an issued certificate.
///
/// A request passes through the inputs, all policy defaults, all policy
/// constraints, key archival or server-side keygen, issuance, key retrieval
/// and the outputs, in that order. Once complete, the updaters run. Output
/// and updater failures are logged and do not fail the request.
pub struct ProfileEngine {
    profiles: Arc<ProfileRegistry>,
    kra: KeyRecoveryController,
    ca: Arc<dyn CaService>,
    repository: Arc<dyn RequestRepository>,
    audit: Arc<dyn AuditSink>,
}

impl ProfileEngine {
    pub fn new(
        profiles: Arc<ProfileRegistry>,
        kra: KeyRecoveryController,
        ca: Arc<dyn CaService>,
        repository: Arc<dyn RequestRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        ProfileEngine { profiles, kra, ca, repository, audit }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn repository(&self) -> &Arc<dyn RequestRepository> {
        &self.repository
    }

    /// Executes a profile for a request.
    ///
    /// On success the request is complete and persisted. Requests that were
    /// rejected or completed before are refused.
    pub fn execute(
        &self, ctx: &AuthContext, profile_id: &str, req: &mut Request
    ) -> PkiResult<Certificate> {
        self.check_not_terminal(req)?;
        let profile = self.profiles.get(profile_id)?;
        if !profile.is_enabled() {
            return Err(Error::ProfileNotEnabled(profile_id.into()))
        }

        let res = self.process(ctx, &profile, req);
        let event = match &res {
            Ok(cert) => {
                AuditEvent::success(AuditEventKind::CertRequestProcessed)
                    .with("CertSerialNum", cert.serial())
            }
            Err(err) => {
                warn!("Request {} failed in profile '{}': {}", req.id(), profile_id, err);
                AuditEvent::failure(AuditEventKind::CertRequestProcessed)
                    .with("Info", err)
            }
        };
        self.audit.log(
            event.with_subject(ctx.user_id())
                .with("RequestID", req.id())
                .with("ProfileID", profile_id)
        );
        res
    }

    fn check_not_terminal(&self, req: &Request) -> PkiEmptyResult {
        if req.status().is_terminal() {
            return Err(Error::RequestTerminal(req.id().clone(), req.status()))
        }
        if let Some(stored) = self.repository.get(req.id())? {
            if stored.status().is_terminal() {
                return Err(Error::RequestTerminal(
                    stored.id().clone(), stored.status()
                ))
            }
        }
        Ok(())
    }

    fn process(
        &self, ctx: &AuthContext, profile: &Profile, req: &mut Request
    ) -> PkiResult<Certificate> {
        debug!("Executing profile '{}' for request {}", profile.id(), req.id());

        for input in profile.inputs() {
            input.populate(ctx, req)?;
        }
        for policy in profile.policies() {
            policy.default.populate(req)?;
        }
        for policy in profile.policies() {
            policy.constraint.validate(req)?;
        }

        let mut stash = None;
        if req.ext().is_server_side_keygen() {
            stash = Some(self.kra.generate_key(ctx, req)?);
            let key = req.ext().public_key().ok_or_else(|| {
                Error::KraRejected {
                    msg: "KRA returned no public key".into(),
                    terminal: false,
                }
            })?;
            let key = SubjectKey::from_base64(key)?;
            if req.ext_mut().cert_info_mut().replace_placeholder_key(key) {
                debug!("Replaced placeholder key of request {}", req.id());
            }
        }
        else if req.ext().archive_options().is_some()
            && req.request_type() != RequestType::Renewal
        {
            self.kra.archive_key(ctx, req)?;
        }

        let info = req.ext().cert_info().cloned().unwrap_or_default();
        let cert = self.ca.issue_x509_cert(
            profile.authority(), &info, profile.id(), req.id()
        ).map_err(|err| err.into_rejection("Unable to issue certificate"))?;
        log_issued(&cert);
        req.ext_mut().set_issued_cert(cert.clone());

        if let Some(stash) = stash {
            self.kra.retrieve_key(ctx, req, stash)?;
        }

        // Issued. Output and updater failures no longer fail the request.
        for output in profile.outputs() {
            if let Err(err) = output.populate(req) {
                warn!(
                    "Output '{}' failed for request {}: {}",
                    output.name(), req.id(), err
                );
            }
        }

        req.set_status(RequestStatus::Complete);
        for updater in profile.updaters() {
            if let Err(err) = updater.update(ctx, req) {
                warn!(
                    "Updater '{}' failed for request {}: {}",
                    updater.name(), req.id(), err
                );
            }
        }
        req.ext_mut().set_is_encryption_cert(info.is_encryption_cert());
        self.repository.store(req)?;

        info!(
            "Request {} completed with certificate {}", req.id(), cert.serial()
        );
        Ok(cert)
    }
}
