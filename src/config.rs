//! Server configuration and logging setup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};
use log::{LevelFilter, error, info};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use crate::authz::AclComposition;
use crate::authz::manager::AuthzManagerConf;
use crate::authz::users::UserConf;
use crate::commons::audit::AuditFormat;
use crate::constants::*;
use crate::profile::ProfileConf;
use crate::profile::issuance::AuthorityConf;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(PKICA_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        PKICA_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./pkica.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn kra_timeout_secs() -> u64 {
        KRA_DEFAULT_TIMEOUT_SECS
    }

    fn kra_invalid_transport_cert() -> String {
        KRA_INVALID_TRANSPORT_CERT.to_string()
    }

    fn session_ttl_secs() -> u64 {
        SESSION_DEFAULT_TTL_SECS
    }

    fn session_sweep_secs() -> u64 {
        SESSION_DEFAULT_SWEEP_SECS
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the CA server.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,

    /// Audit events go here instead of the main log if set.
    #[serde(default)]
    audit_log_file: Option<PathBuf>,

    #[serde(default)]
    audit_log_format: AuditFormat,

    #[serde(default)]
    pub acl: AclConfig,

    #[serde(default)]
    pub acls: Vec<String>,

    #[serde(default)]
    pub authz_managers: Vec<AuthzManagerConf>,

    #[serde(default)]
    pub users: Vec<UserConf>,

    #[serde(default)]
    pub kra: KraConfig,

    #[serde(default)]
    pub authorities: Vec<AuthorityConf>,

    #[serde(default)]
    pub profiles: Vec<ProfileConf>,

    #[serde(default)]
    pub sessions: SessionConfig,
}

/// # Accessors
impl Config {
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn audit_log_file(&self) -> Option<&Path> {
        self.audit_log_file.as_deref()
    }

    pub fn audit_log_format(&self) -> AuditFormat {
        self.audit_log_format
    }
}

/// # Create
impl Config {
    /// Creates the config at startup.
    ///
    /// Reads the file, initializes logging and verifies the result.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == Path::new(PKICA_DEFAULT_CONFIG_FILE) {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to \
                         specify its location.",
                    ))
                }
                else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file.display(), e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!(
                    "{} uses configuration file: {}",
                    PKICA_SERVER_APP, config_file.display()
                );
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(), e
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::other("sessions.ttl_secs must be positive"))
        }
        if self.sessions.sweep_interval_secs == 0 {
            return Err(ConfigError::other(
                "sessions.sweep_interval_secs must be positive"
            ))
        }
        if self.sessions.store == SessionStoreType::Directory
            && self.sessions.base_dn.is_none()
        {
            return Err(ConfigError::other(
                "sessions.base_dn is required for the directory store"
            ))
        }
        if self.kra.enabled && self.kra.timeout_secs == 0 {
            return Err(ConfigError::other("kra.timeout_secs must be positive"))
        }
        if self.kra.timeout_secs > KRA_MAX_TIMEOUT_SECS {
            return Err(ConfigError::Other(format!(
                "kra.timeout_secs must not exceed {KRA_MAX_TIMEOUT_SECS}"
            )))
        }

        let mut realms = HashSet::new();
        for manager in &self.authz_managers {
            for realm in manager.realm_list() {
                if !realms.insert(realm.clone()) {
                    return Err(ConfigError::Other(format!(
                        "realm '{realm}' is claimed by more than one \
                         authorization manager"
                    )))
                }
            }
        }

        let mut profile_ids = HashSet::new();
        for profile in &self.profiles {
            if !profile_ids.insert(profile.id.as_str()) {
                return Err(ConfigError::Other(format!(
                    "duplicate profile id '{}'", profile.id
                )))
            }
            if !self.authorities.iter().any(|ca| ca.id == profile.authority) {
                return Err(ConfigError::Other(format!(
                    "profile '{}' refers to unknown authority '{}'",
                    profile.id, profile.authority
                )))
            }
            if let Some(authz) = profile.authz.as_ref() {
                if !self.authz_managers.iter().any(|mgr| {
                    mgr.name == authz.manager
                }) {
                    return Err(ConfigError::Other(format!(
                        "profile '{}' refers to unknown authorization \
                         manager '{}'",
                        profile.id, authz.manager
                    )))
                }
            }
        }

        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| {
                        ConfigError::other("Invalid syslog_facility")
                    })?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => {
                Err(ConfigError::other("syslog is only supported on unix"))
            }
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.apply_logger(io::stderr()).map_err(|e| {
            ConfigError::Other(format!("Failed to init stderr logging: {e}"))
        })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.apply_logger(file).map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {e}"))
        })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(
        &self, facility: syslog::Facility
    ) -> Result<(), ConfigError> {
        let process = env::current_exe().ok().and_then(|path| {
            path.file_name()
                .and_then(std::ffi::OsStr::to_str)
                .map(ToString::to_string)
        }).unwrap_or_else(|| String::from("pkica"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => self.apply_logger(logger).map_err(|e| {
                ConfigError::Other(format!("Failed to init syslog: {e}"))
            }),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {err}");
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Installs the logger for the given output.
    ///
    /// With an `audit_log_file`, audit events are split off into that file
    /// and kept out of the main output.
    fn apply_logger(
        &self, output: impl Into<fern::Output>
    ) -> Result<(), ConfigError> {
        let dispatch = match self.audit_log_file.as_ref() {
            None => self.fern_logger().chain(output),
            Some(path) => {
                let audit_file = fern::log_file(path).map_err(|err| {
                    ConfigError::Other(format!(
                        "Failed to open audit log file '{}': {}",
                        path.display(), err
                    ))
                })?;
                self.fern_logger()
                    .chain(
                        fern::Dispatch::new()
                            .filter(|meta| meta.target() == AUDIT_LOG_TARGET)
                            .chain(audit_file)
                    )
                    .chain(
                        fern::Dispatch::new()
                            .filter(|meta| meta.target() != AUDIT_LOG_TARGET)
                            .chain(output)
                    )
            }
        };
        dispatch.apply().map_err(|e| ConfigError::Other(e.to_string()))
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                }
                else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
            .level_for(AUDIT_LOG_TARGET, self.log_level.max(LevelFilter::Info))
    }
}


//------------ AclConfig -----------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AclConfig {
    #[serde(default)]
    pub composition: AclComposition,

    /// Reject ACLs naming undeclared rights instead of dropping them.
    #[serde(default)]
    pub strict: bool,
}


//------------ KraConfig -----------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct KraConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "ConfigDefaults::kra_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "ConfigDefaults::kra_invalid_transport_cert")]
    pub invalid_transport_cert_message: String,
}

impl KraConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for KraConfig {
    fn default() -> Self {
        KraConfig {
            enabled: false,
            timeout_secs: ConfigDefaults::kra_timeout_secs(),
            invalid_transport_cert_message:
                ConfigDefaults::kra_invalid_transport_cert(),
        }
    }
}


//------------ SessionConfig -------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub store: SessionStoreType,

    #[serde(default = "ConfigDefaults::session_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "ConfigDefaults::session_sweep_secs")]
    pub sweep_interval_secs: u64,

    /// The base DN of the directory store.
    #[serde(default)]
    pub base_dn: Option<String>,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            store: SessionStoreType::default(),
            ttl_secs: ConfigDefaults::session_ttl_secs(),
            sweep_interval_secs: ConfigDefaults::session_sweep_secs(),
            base_dn: None,
        }
    }
}


//------------ SessionStoreType ----------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreType {
    #[default]
    Memory,
    Directory,
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{string}\""
            ))),
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//============ Tests =========================================================
