//! Authorization.
//!
//! Every protected operation passes through the [`AuthzSubsystem`], which
//! hands the request to a named [`AuthzManager`]. The ACL based manager
//! looks up the [`Acl`] of the resource and evaluates its entries with the
//! registered [access evaluators][evaluator::AccessEvaluator].

pub mod acl;
pub mod evaluator;
pub mod manager;
pub mod subsystem;
pub mod token;
pub mod users;

pub use self::acl::{Acl, AclComposition, AclEntry, AclStore};
pub use self::manager::{AuthzManager, AuthzManagerConf};
pub use self::subsystem::AuthzSubsystem;
pub use self::token::{AuthContext, AuthToken, AuthzToken};
