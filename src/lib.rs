//! The _pkica_ library crate.
//!
//! A certificate authority core: enrollment profiles, key recovery
//! authority round trips, ACL based authorization and security domain
//! sessions. The [`server::CaServer`] wires them together.

pub mod authz;
pub mod commons;
pub mod config;
pub mod constants;
pub mod profile;
pub mod server;
pub mod session;
