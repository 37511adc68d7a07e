//! Integration tests for ipsec-chain
//!
//! Exercises chains, services and verifiers through the public API only.
//!
//! # Test Organization
//!
//! - `chain_composition`: ordering, stop-on-failure and best-effort close
//!   with user-defined elements
//! - `ipsec_suite`: client and endpoint over the in-process transport,
//!   verified against in-memory dataplanes
//!
//! # Test Requirements
//!
//! - No network access or privileges: every dataplane is in memory

pub mod chain_composition;
pub mod ipsec_suite;
