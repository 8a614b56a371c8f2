//! Authentication
//!
//! Shared-secret proof scheme used by both the upgrade handshake and the
//! mutating HTTP endpoints.

pub mod token;

pub use token::{Md5Proof, ProofDigest, Sha256Proof, TokenAuthenticator, disclose_token};
