//! Various server-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `pkica` binary.
pub const PKICA_SERVER_APP: &str = "PKI Certificate Authority";


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const PKICA_DEFAULT_CONFIG_FILE: &str = "/etc/pkica.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const PKICA_ENV_LOG_LEVEL: &str = "PKICA_LOG_LEVEL";


//------------ Logging ------------------------------------------------------

/// The log target audit events are written to.
pub const AUDIT_LOG_TARGET: &str = "pkica::audit";


//------------ Authorization ------------------------------------------------

/// The name of the ACL based authorization plugin.
pub const AUTHZ_PLUGIN_ACL: &str = "BasicAclAuthz";

/// The name of the group based authorization plugin.
pub const AUTHZ_PLUGIN_GROUP: &str = "BasicGroupAuthz";

/// The prefix of session attributes copied from an original request.
pub const ORIG_REQ_PREFIX: &str = "orig_req.";


//------------ Key Recovery -------------------------------------------------

/// The default deadline for a single KRA round trip.
pub const KRA_DEFAULT_TIMEOUT_SECS: u64 = 60;

/// The longest deadline allowed for a single KRA round trip.
pub const KRA_MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// The error text a KRA reports for an unusable transport certificate.
pub const KRA_INVALID_TRANSPORT_CERT: &str =
    "Server-Side Keygen enrollment failed: invalid transport certificate";


//------------ Sessions -----------------------------------------------------

/// The default time-to-live of a security domain session.
pub const SESSION_DEFAULT_TTL_SECS: u64 = 2 * 60 * 60;

/// The default interval between two sweeps of the session table.
pub const SESSION_DEFAULT_SWEEP_SECS: u64 = 5 * 60;

/// The relative DN of the session container below the base DN.
pub const SESSION_CONTAINER_RDN: &str = "ou=sessions,ou=Security Domain";

/// The object class of session entries in the directory.
pub const SESSION_OBJECT_CLASS: &str = "securityDomainSessionEntry";
