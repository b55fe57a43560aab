//! Persistence of requests.

use std::collections::HashMap;
use std::sync::RwLock;
use log::trace;
use super::request::{Request, RequestId};
use crate::commons::{PkiEmptyResult, PkiResult};


//------------ RequestRepository ---------------------------------------------

/// Stores requests between executions.
///
/// Implementations must never persist the sensitive fields of a request.
pub trait RequestRepository: Send + Sync {
    fn store(&self, request: &Request) -> PkiEmptyResult;

    fn get(&self, id: &RequestId) -> PkiResult<Option<Request>>;
}


//------------ MemoryRequestRepository ---------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRequestRepository {
    requests: RwLock<HashMap<RequestId, Request>>,
}

impl MemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestRepository for MemoryRequestRepository {
    fn store(&self, request: &Request) -> PkiEmptyResult {
        let mut copy = request.clone();
        copy.ext_mut().take_sensitive();
        trace!("Storing request {} with status {}", copy.id(), copy.status());
        self.requests.write().expect("poisoned lock").insert(
            copy.id().clone(), copy
        );
        Ok(())
    }

    fn get(&self, id: &RequestId) -> PkiResult<Option<Request>> {
        Ok(self.requests.read().expect("poisoned lock").get(id).cloned())
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::request::{RequestStatus, SensitiveBytes, SensitiveFields};

    #[test]
    fn stored_requests_have_no_secrets() {
        let repo = MemoryRequestRepository::new();
        let mut req = Request::server_side_keygen(SensitiveFields {
            session_key: Some(SensitiveBytes::new(vec![1])),
            wrapped_passphrase: None,
        });
        req.set_status(RequestStatus::Rejected);
        repo.store(&req).unwrap();

        let stored = repo.get(req.id()).unwrap().unwrap();
        assert_eq!(stored.status(), RequestStatus::Rejected);
        assert!(stored.ext().sensitive().is_empty());
        assert!(!req.ext().sensitive().is_empty());
        assert_eq!(repo.len(), 1);
        assert!(repo.get(&RequestId::from("other")).unwrap().is_none());
    }
}
