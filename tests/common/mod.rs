#![allow(dead_code)] // Different tests use different parts.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Instant;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use tempfile::TempDir;
use pkica::commons::{PkiEmptyResult, PkiResult};
use pkica::commons::audit::MemoryAuditSink;
use pkica::config::Config;
use pkica::profile::certinfo::CertificateInfo;
use pkica::profile::request::{KeygenStage, SensitiveBytes, SensitiveFields};
use pkica::profile::{
    CaService, Certificate, KraConnector, OpenSslIssuer, Request, RequestId,
};
use pkica::server::{CaServer, Collaborators};


//------------ Logging -------------------------------------------------------

static LOGGING: Once = Once::new();

/// Enables log output for a test run with `--nocapture`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = stderrlog::new().verbosity(log::Level::Debug).init();
    });
}


//------------ TestAuthority -------------------------------------------------

/// A self-signed authority with its PEM files in a temporary directory.
pub struct TestAuthority {
    pub cert: X509,
    pub key: PKey<Private>,
    dir: TempDir,
}

impl TestAuthority {
    pub fn create() -> Self {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("O", "Example").unwrap();
        name.append_entry_by_text("CN", "Test CA").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(Asn1Time::days_from_now(0).unwrap().as_ref()).unwrap();
        builder.set_not_after(Asn1Time::days_from_now(3650).unwrap().as_ref()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cert.pem"), cert.to_pem().unwrap()).unwrap();
        fs::write(
            dir.path().join("key.pem"), key.private_key_to_pem_pkcs8().unwrap()
        ).unwrap();

        TestAuthority { cert, key, dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The `[[authorities]]` table for a config file.
    pub fn config_section(&self, id: &str) -> String {
        format!(
            "[[authorities]]\nid = \"{}\"\ncert_pem = \"{}\"\nkey_pem = \"{}\"\n",
            id,
            self.dir.path().join("cert.pem").display(),
            self.dir.path().join("key.pem").display(),
        )
    }
}


//------------ Keys ----------------------------------------------------------

/// A fresh base64 encoded RSA SubjectPublicKeyInfo.
pub fn rsa_public_key_b64() -> String {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    BASE64.encode(key.public_key_to_der().unwrap())
}

pub fn keygen_secrets() -> SensitiveFields {
    SensitiveFields {
        session_key: Some(SensitiveBytes::new(b"wrapped session key".to_vec())),
        wrapped_passphrase: Some(SensitiveBytes::new(b"passphrase".to_vec())),
    }
}


//------------ TestKra -------------------------------------------------------

/// What the test KRA saw for one call.
#[derive(Clone, Debug)]
pub struct KraCall {
    pub stage: Option<KeygenStage>,
    pub had_secrets: bool,
}

/// A KRA answering from a script.
///
/// Keygen requests get a fresh RSA public key. Calls answer with `error`
/// if set, limited to one keygen stage if `fail_stage` is set.
#[derive(Default)]
pub struct TestKra {
    pub error: Option<String>,
    pub fail_stage: Option<KeygenStage>,
    calls: Mutex<Vec<KraCall>>,
}

impl TestKra {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(TestKra { error: Some(error.into()), ..Default::default() })
    }

    pub fn failing_at(stage: KeygenStage, error: &str) -> Arc<Self> {
        Arc::new(TestKra {
            error: Some(error.into()),
            fail_stage: Some(stage),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<KraCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl KraConnector for TestKra {
    fn send(&self, req: &mut Request, _deadline: Instant) -> PkiEmptyResult {
        let stage = req.ext().keygen_stage();
        self.calls.lock().unwrap().push(KraCall {
            stage,
            had_secrets: !req.ext().sensitive().is_empty(),
        });
        if let Some(error) = self.error.as_ref() {
            if self.fail_stage.is_none() || self.fail_stage == stage {
                req.set_result(false, Some(error.clone()));
                return Ok(())
            }
        }
        if stage == Some(KeygenStage::Keygen) {
            req.ext_mut().set_public_key(rsa_public_key_b64());
        }
        req.set_result(true, None);
        Ok(())
    }
}


//------------ CountingCa ----------------------------------------------------

/// What the CA was asked to certify, and how far the KRA had got by then.
#[derive(Clone, Debug)]
pub struct Issuance {
    pub info: CertificateInfo,
    pub kra_calls: usize,
}

/// An issuer for a test authority that records every issuance.
pub struct CountingCa {
    inner: OpenSslIssuer,
    kra: Option<Arc<TestKra>>,
    issued: Mutex<Vec<Issuance>>,
}

impl CountingCa {
    /// Issues from `ca` under the id "ca".
    pub fn new(ca: &TestAuthority, kra: Option<Arc<TestKra>>) -> Arc<Self> {
        let mut inner = OpenSslIssuer::new();
        inner.add_authority("ca", ca.cert.clone(), ca.key.clone()).unwrap();
        Arc::new(CountingCa { inner, kra, issued: Mutex::new(Vec::new()) })
    }

    pub fn issued(&self) -> Vec<Issuance> {
        self.issued.lock().unwrap().clone()
    }
}

impl CaService for CountingCa {
    fn issue_x509_cert(
        &self,
        authority_id: &str,
        info: &CertificateInfo,
        profile_id: &str,
        request_id: &RequestId,
    ) -> PkiResult<Certificate> {
        self.issued.lock().unwrap().push(Issuance {
            info: info.clone(),
            kra_calls: self.kra.as_ref().map(|kra| kra.calls().len()).unwrap_or(0),
        });
        self.inner.issue_x509_cert(authority_id, info, profile_id, request_id)
    }
}


//------------ Config and Server ---------------------------------------------

pub const INVALID_TRANSPORT_CERT: &str = "Invalid KRA transport certificate";

/// A config with one authority "ca" and the given extra sections.
pub fn config(ca: &TestAuthority, extra: &str) -> Arc<Config> {
    let content = format!(
        "acls = [\n\
         'certServer.ee.profile:submit:allow (submit) user=\"anybody\":Enrollment',\n\
         'certServer.ca.certs:read,revoke:allow (read,revoke) group=\"Agents\";deny (revoke) user=\"mallory\":Certificates',\n\
         ]\n\n\
         [kra]\n\
         enabled = true\n\
         timeout_secs = 5\n\
         invalid_transport_cert_message = \"{INVALID_TRANSPORT_CERT}\"\n\n\
         [[authz_managers]]\n\
         name = \"DirAclAuthz\"\n\
         plugin = \"BasicAclAuthz\"\n\
         realms = \"dept1\"\n\n\
         [[users]]\n\
         uid = \"alice\"\n\
         groups = [\"Agents\"]\n\n\
         [[users]]\n\
         uid = \"mallory\"\n\
         groups = [\"Agents\"]\n\n\
         {}\n\
         {}\n",
        ca.config_section("ca"),
        extra,
    );
    let config = Config::parse(&content).unwrap();
    config.verify().unwrap();
    Arc::new(config)
}

/// A user enrollment profile issuing from "ca".
pub const USER_PROFILE: &str = r#"
[[profiles]]
id = "caUserCert"
authority = "ca"

[profiles.authz]
manager = "DirAclAuthz"
resource = "certServer.ee.profile"

[[profiles.inputs]]
type = "key"

[[profiles.inputs]]
type = "subject_name"

[[profiles.inputs]]
type = "archive_options"

[[profiles.policies]]
default = { type = "subject_name", pattern = "$request.subject$" }
constraint = { type = "subject_name", pattern = "CN=[^,]+(,.*)?" }

[[profiles.policies]]
default = { type = "validity", range_days = 30 }
constraint = { type = "validity", max_days = 365 }

[[profiles.policies]]
default = { type = "key_usage", usages = ["digital_signature", "key_encipherment"] }

[[profiles.policies]]
constraint = { type = "key", algorithms = ["rsa"], min_rsa_size = 2048 }

[[profiles.outputs]]
type = "cert_pem"

[[profiles.outputs]]
type = "cert_summary"
"#;

pub struct TestServer {
    pub server: CaServer,
    pub audit: Arc<MemoryAuditSink>,
    pub ca: TestAuthority,
}

impl TestServer {
    pub fn start(kra: Option<Arc<TestKra>>, extra: &str) -> Self {
        Self::start_with(TestAuthority::create(), kra, None, extra)
    }

    /// Starts a server for `ca`, issuing through `issuer` if given.
    pub fn start_with(
        ca: TestAuthority,
        kra: Option<Arc<TestKra>>,
        issuer: Option<Arc<dyn CaService>>,
        extra: &str,
    ) -> Self {
        init_logging();
        let audit = Arc::new(MemoryAuditSink::new());
        let server = CaServer::build(
            config(&ca, extra),
            Collaborators {
                kra: kra.map(|kra| kra as Arc<dyn KraConnector>),
                ca: issuer,
                audit: Some(audit.clone()),
                ..Default::default()
            },
        ).unwrap();
        TestServer { server, audit, ca }
    }
}
