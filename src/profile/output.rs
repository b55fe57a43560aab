//! Profile outputs: what the client gets back.

use serde::Deserialize;
use super::issuance::Certificate;
use super::request::Request;
use crate::commons::{Error, PkiEmptyResult};


pub const OUTPUT_CERT_PEM: &str = "cert_pem";
pub const OUTPUT_CERT_SERIAL: &str = "cert_serial";
pub const OUTPUT_CERT_SUBJECT: &str = "cert_subject";
pub const OUTPUT_CERT_NOT_BEFORE: &str = "cert_not_before";
pub const OUTPUT_CERT_NOT_AFTER: &str = "cert_not_after";


//------------ ProfileOutput -------------------------------------------------

/// Writes results of the issuance into the request.
pub trait ProfileOutput: Send + Sync {
    fn name(&self) -> &str;

    fn populate(&self, req: &mut Request) -> PkiEmptyResult;
}


//------------ OutputConf ----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConf {
    CertPem,
    CertSummary,
}

impl OutputConf {
    pub fn build(&self) -> Box<dyn ProfileOutput> {
        match self {
            OutputConf::CertPem => Box::new(CertPemOutput),
            OutputConf::CertSummary => Box::new(CertSummaryOutput),
        }
    }
}

fn issued_cert(req: &Request) -> Result<Certificate, Error> {
    req.ext().issued_cert().cloned().ok_or_else(|| {
        Error::custom(format!("Request {} has no issued certificate", req.id()))
    })
}


//------------ CertPemOutput -------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct CertPemOutput;

impl ProfileOutput for CertPemOutput {
    fn name(&self) -> &str {
        "cert_pem"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        let pem = issued_cert(req)?.to_pem()?;
        req.ext_mut().set_string(OUTPUT_CERT_PEM, pem);
        Ok(())
    }
}


//------------ CertSummaryOutput ---------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct CertSummaryOutput;

impl ProfileOutput for CertSummaryOutput {
    fn name(&self) -> &str {
        "cert_summary"
    }

    fn populate(&self, req: &mut Request) -> PkiEmptyResult {
        let cert = issued_cert(req)?;
        let ext = req.ext_mut();
        ext.set_string(OUTPUT_CERT_SERIAL, cert.serial());
        ext.set_string(OUTPUT_CERT_SUBJECT, cert.subject());
        ext.set_string(OUTPUT_CERT_NOT_BEFORE, cert.not_before().to_rfc3339());
        ext.set_string(OUTPUT_CERT_NOT_AFTER, cert.not_after().to_rfc3339());
        Ok(())
    }
}
