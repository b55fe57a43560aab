//! Enrollment profiles.
//!
//! A [`Profile`] is a chain of inputs, policies, outputs and updaters. The
//! [`ProfileEngine`] runs a [`Request`] through a profile, involving the
//! key recovery authority where needed, and has the result issued by a
//! [`CaService`].

pub mod certinfo;
pub mod engine;
pub mod input;
pub mod issuance;
pub mod keyrecovery;
pub mod output;
pub mod policy;
pub mod registry;
pub mod repository;
pub mod request;
pub mod updater;

pub use self::engine::ProfileEngine;
pub use self::issuance::{CaService, Certificate, OpenSslIssuer};
pub use self::keyrecovery::{KeyRecoveryController, KraConnector};
pub use self::registry::{Profile, ProfileConf, ProfileRegistry};
pub use self::repository::{MemoryRequestRepository, RequestRepository};
pub use self::request::{Request, RequestId, RequestStatus, RequestType};
