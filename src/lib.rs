//! Seals a 32-byte vault key to TPM PCR values and releases it only on a
//! boot whose measurements match.
//!
//! The unit tests run against an in-memory TPM, no hardware is needed.

pub mod cli;
pub mod config;
pub mod eventlog;
pub mod file;
pub mod seal;
pub mod snapshot;
pub mod tpm;
pub mod vault;
