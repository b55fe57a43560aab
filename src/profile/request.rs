//! Certificate requests and their extension data.

use std::collections::BTreeMap;
use std::{fmt, str};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::certinfo::CertificateInfo;
use super::issuance::Certificate;


//------------ RequestId -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a new random request id.
    pub fn random() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ RequestStatus -------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Processing has (re)started. Set before key retrieval.
    Begin,
    Pending,
    Approved,
    Rejected,
    Complete,
}

impl RequestStatus {
    /// Returns whether no further processing is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Complete)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RequestStatus::Begin => "begin",
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Complete => "complete",
        })
    }
}


//------------ RequestType ---------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Enrollment,
    Renewal,
    Revocation,
}


//------------ KeygenStage ---------------------------------------------------

/// The stage of a server-side keygen round trip.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeygenStage {
    Keygen,
    KeyRetrieve,
}

impl fmt::Display for KeygenStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            KeygenStage::Keygen => "KEYGEN",
            KeygenStage::KeyRetrieve => "KEY_RETRIEVE",
        })
    }
}


//------------ SensitiveBytes ------------------------------------------------

/// Secret material that must not leak into logs.
///
/// The bytes are overwritten when the value is dropped.
#[derive(Clone, Eq, PartialEq)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        SensitiveBytes(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SensitiveBytes(<redacted>)")
    }
}

impl Drop for SensitiveBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|byte| *byte = 0);
    }
}


//------------ SensitiveFields -----------------------------------------------

/// The two transient secrets of a server-side keygen request.
#[derive(Clone, Debug, Default)]
pub struct SensitiveFields {
    /// The session key, wrapped with the KRA transport key.
    pub session_key: Option<SensitiveBytes>,

    /// The PKCS #12 passphrase, wrapped with the session key.
    pub wrapped_passphrase: Option<SensitiveBytes>,
}

impl SensitiveFields {
    pub fn is_empty(&self) -> bool {
        self.session_key.is_none() && self.wrapped_passphrase.is_none()
    }
}


//------------ ExtData -------------------------------------------------------

/// The extension data of a request.
///
/// Fields the server itself works with are typed. Everything else, such as
/// raw profile inputs and outputs, lives in a string map. Unknown keys are
/// simply carried along.
#[derive(Clone, Debug, Default)]
pub struct ExtData {
    cert_info: Option<CertificateInfo>,
    archive_options: Option<Vec<u8>>,
    server_side_keygen: bool,
    keygen_stage: Option<KeygenStage>,
    sensitive: SensitiveFields,
    public_key: Option<String>,
    issued_cert: Option<Certificate>,
    is_encryption_cert: Option<bool>,
    result: Option<bool>,
    error: Option<String>,
    values: BTreeMap<String, String>,
}

impl ExtData {
    pub fn cert_info(&self) -> Option<&CertificateInfo> {
        self.cert_info.as_ref()
    }

    /// Returns the certificate info, creating an empty one if needed.
    pub fn cert_info_mut(&mut self) -> &mut CertificateInfo {
        self.cert_info.get_or_insert_with(Default::default)
    }

    pub fn set_cert_info(&mut self, info: CertificateInfo) {
        self.cert_info = Some(info)
    }

    pub fn archive_options(&self) -> Option<&[u8]> {
        self.archive_options.as_deref()
    }

    pub fn set_archive_options(&mut self, options: Vec<u8>) {
        self.archive_options = Some(options)
    }

    pub fn is_server_side_keygen(&self) -> bool {
        self.server_side_keygen
    }

    pub fn set_server_side_keygen(&mut self, ssk: bool) {
        self.server_side_keygen = ssk
    }

    pub fn keygen_stage(&self) -> Option<KeygenStage> {
        self.keygen_stage
    }

    pub fn set_keygen_stage(&mut self, stage: KeygenStage) {
        self.keygen_stage = Some(stage)
    }

    pub fn sensitive(&self) -> &SensitiveFields {
        &self.sensitive
    }

    pub fn set_sensitive(&mut self, fields: SensitiveFields) {
        self.sensitive = fields
    }

    /// Removes and returns the transient secrets.
    pub fn take_sensitive(&mut self) -> SensitiveFields {
        std::mem::take(&mut self.sensitive)
    }

    /// Returns the base64 encoded public key reported by the KRA.
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn set_public_key(&mut self, key: impl Into<String>) {
        self.public_key = Some(key.into())
    }

    pub fn issued_cert(&self) -> Option<&Certificate> {
        self.issued_cert.as_ref()
    }

    pub fn set_issued_cert(&mut self, cert: Certificate) {
        self.issued_cert = Some(cert)
    }

    pub fn is_encryption_cert(&self) -> Option<bool> {
        self.is_encryption_cert
    }

    pub fn set_is_encryption_cert(&mut self, value: bool) {
        self.is_encryption_cert = Some(value)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Deletes a string value, returning whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }
}


//------------ Request -------------------------------------------------------

/// A certificate request travelling through a profile.
///
/// A request is owned by the one execution processing it. Collaborators
/// such as the KRA connector write their response into the request.
#[derive(Clone, Debug)]
pub struct Request {
    id: RequestId,
    request_type: RequestType,
    status: RequestStatus,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    ext: ExtData,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self::with_id(RequestId::random(), request_type)
    }

    pub fn with_id(id: RequestId, request_type: RequestType) -> Self {
        let now = Utc::now();
        Request {
            id,
            request_type,
            status: RequestStatus::Pending,
            created: now,
            modified: now,
            ext: ExtData::default(),
        }
    }

    /// Creates an enrollment request asking the KRA to generate the key.
    pub fn server_side_keygen(sensitive: SensitiveFields) -> Self {
        let mut res = Self::new(RequestType::Enrollment);
        res.ext.set_server_side_keygen(true);
        res.ext.set_sensitive(sensitive);
        res
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.modified = Utc::now();
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn ext(&self) -> &ExtData {
        &self.ext
    }

    pub fn ext_mut(&mut self) -> &mut ExtData {
        &mut self.ext
    }

    /// Sets a raw input value.
    pub fn with_input(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ext.set_string(key, value);
        self
    }

    /// Returns whether the last remote round trip succeeded.
    pub fn is_success(&self) -> bool {
        self.ext.result == Some(true)
    }

    /// Returns the error reported by the last remote round trip.
    pub fn error(&self) -> Option<&str> {
        self.ext.error.as_deref()
    }

    /// Records the outcome of a remote round trip.
    pub fn set_result(&mut self, success: bool, error: Option<String>) {
        self.ext.result = Some(success);
        self.ext.error = error;
    }

    /// Forgets the outcome of the last remote round trip.
    pub fn clear_result(&mut self) {
        self.ext.result = None;
        self.ext.error = None;
    }
}


//============ Tests =========================================================
