//! Round trips to the key recovery authority.
//!
//! Two kinds of request go to the KRA. Key archival sends the client's
//! archive options along with an enrollment. Server-side keygen is a two
//! phase exchange: phase one asks the KRA for a key pair, and after the
//! certificate was issued, phase two retrieves the wrapped private key.
//!
//! The transport-wrapped session key and the wrapped passphrase are only
//! attached to the request while phase two is in flight.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use super::request::{KeygenStage, Request, RequestStatus, SensitiveFields};
use super::repository::RequestRepository;
use crate::authz::AuthContext;
use crate::commons::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::commons::{Error, PkiEmptyResult, PkiResult};


//------------ KraConnector --------------------------------------------------

/// The connection to a key recovery authority.
///
/// The connector writes the response into the request. Afterwards
/// [`Request::is_success`] and [`Request::error`] tell the outcome, and on
/// keygen the generated public key is in the extension data.
pub trait KraConnector: Send + Sync {
    /// Sends the request.
    ///
    /// The connector must give up once `deadline` has passed.
    fn send(&self, request: &mut Request, deadline: Instant) -> PkiEmptyResult;
}


//------------ SensitiveFieldGuard -------------------------------------------

/// Gives access to a request and strips its secrets when dropped.
pub struct SensitiveFieldGuard<'a> {
    request: &'a mut Request,
}

impl<'a> SensitiveFieldGuard<'a> {
    /// Attaches the secrets to the request for the life of the guard.
    pub fn attach(request: &'a mut Request, fields: SensitiveFields) -> Self {
        request.ext_mut().set_sensitive(fields);
        SensitiveFieldGuard { request }
    }
}

impl Deref for SensitiveFieldGuard<'_> {
    type Target = Request;

    fn deref(&self) -> &Request {
        self.request
    }
}

impl DerefMut for SensitiveFieldGuard<'_> {
    fn deref_mut(&mut self) -> &mut Request {
        self.request
    }
}

impl Drop for SensitiveFieldGuard<'_> {
    fn drop(&mut self) {
        if !self.request.ext_mut().take_sensitive().is_empty() {
            debug!("Removed sensitive fields from request {}", self.request.id());
        }
    }
}


//------------ KeyRecoveryController -----------------------------------------

pub struct KeyRecoveryController {
    connector: Option<Arc<dyn KraConnector>>,
    timeout: Duration,
    invalid_transport_cert: String,
    repository: Arc<dyn RequestRepository>,
    audit: Arc<dyn AuditSink>,
}

impl KeyRecoveryController {
    pub fn new(
        connector: Option<Arc<dyn KraConnector>>,
        timeout: Duration,
        invalid_transport_cert: impl Into<String>,
        repository: Arc<dyn RequestRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        KeyRecoveryController {
            connector,
            timeout,
            invalid_transport_cert: invalid_transport_cert.into(),
            repository,
            audit,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.connector.is_some()
    }

    /// Sends the request for key archival.
    pub fn archive_key(
        &self, ctx: &AuthContext, req: &mut Request
    ) -> PkiEmptyResult {
        debug!("Sending request {} to the KRA for key archival", req.id());
        let res = self.round_trip(req);
        self.audit(AuditEventKind::KeyArchivalRequest, ctx, req, &res);
        res.map_err(|err| err.into_rejection("Key archival failed"))
    }

    /// Runs phase one of server-side keygen.
    ///
    /// Strips the secrets from the request before sending and returns them
    /// for phase two.
    pub fn generate_key(
        &self, ctx: &AuthContext, req: &mut Request
    ) -> PkiResult<SensitiveFields> {
        req.ext_mut().set_keygen_stage(KeygenStage::Keygen);
        let stash = req.ext_mut().take_sensitive();
        debug!("Sending request {} to the KRA for key generation", req.id());
        let res = self.round_trip(req);
        self.audit(AuditEventKind::ServerSideKeygenRequest, ctx, req, &res);
        match res {
            Ok(()) => Ok(stash),
            Err(err) => Err(err.into_rejection("Server-side keygen failed")),
        }
    }

    /// Runs phase two of server-side keygen.
    ///
    /// The secrets are attached for the round trip and gone again when this
    /// returns, whatever the outcome.
    pub fn retrieve_key(
        &self, ctx: &AuthContext, req: &mut Request, stash: SensitiveFields
    ) -> PkiEmptyResult {
        req.ext_mut().set_keygen_stage(KeygenStage::KeyRetrieve);
        req.set_status(RequestStatus::Begin);

        let mut guarded = SensitiveFieldGuard::attach(req, stash);
        debug!("Retrieving generated key for request {}", guarded.id());
        let res = self.round_trip(&mut guarded);
        drop(guarded);

        self.audit(AuditEventKind::ServerSideKeygenRetrieve, ctx, req, &res);
        res.map_err(|err| err.into_rejection("Key retrieval failed"))
    }

    /// Sends the request and evaluates the response.
    fn round_trip(&self, req: &mut Request) -> PkiEmptyResult {
        let Some(connector) = self.connector.as_ref() else {
            error!("No KRA connector configured, cannot process request {}", req.id());
            return Err(Error::KraNotConfigured)
        };

        let deadline = Instant::now().checked_add(self.timeout).ok_or_else(|| {
            Error::custom(format!(
                "KRA timeout of {}s is out of range", self.timeout.as_secs()
            ))
        })?;
        req.clear_result();
        connector.send(req, deadline)?;
        if Instant::now() > deadline {
            warn!("KRA response for request {} arrived after the deadline", req.id());
            return Err(Error::KraTimeout)
        }
        if req.is_success() {
            return Ok(())
        }

        let msg = req.error().unwrap_or("unknown KRA error").to_string();
        if msg == self.invalid_transport_cert {
            req.set_status(RequestStatus::Rejected);
            self.repository.store(req)?;
            warn!("Request {} rejected: {}", req.id(), msg);
            Err(Error::KraRejected { msg, terminal: true })
        }
        else {
            Err(Error::KraRejected { msg, terminal: false })
        }
    }

    fn audit(
        &self,
        kind: AuditEventKind,
        ctx: &AuthContext,
        req: &Request,
        res: &PkiEmptyResult,
    ) {
        let client_id = req.ext().cert_info().and_then(|info| {
            info.client_id()
        }).unwrap_or("");
        let event = match res {
            Ok(()) => {
                info!("{} succeeded for request {}", kind, req.id());
                AuditEvent::success(kind)
            }
            Err(err) => AuditEvent::failure(kind).with("Info", err),
        };
        self.audit.log(
            event.with_subject(ctx.user_id())
                .with("RequestID", req.id())
                .with("ClientID", client_id)
        );
    }
}


//============ Tests =========================================================
