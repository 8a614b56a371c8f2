//! Token authenticator
//!
//! A client proves knowledge of the shared secret by sending
//! `hex(H(secret ‖ subject ‖ salt)) ‖ salt`, where `subject` is the token the
//! server disclosed during upgrade (or the request path for the single-shot
//! HTTP endpoints).

use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::DigestKind;
use crate::error::AuthError;

/// Hash primitive behind the proof scheme.
pub trait ProofDigest: Send + Sync {
    /// Lowercase hex digest of the concatenated parts.
    fn hex_digest(&self, parts: &[&[u8]]) -> String;

    /// Length of the hex digest produced.
    fn hex_len(&self) -> usize;
}

fn hex_of<D: Digest>(parts: &[&[u8]]) -> String {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

pub struct Md5Proof;

impl ProofDigest for Md5Proof {
    fn hex_digest(&self, parts: &[&[u8]]) -> String {
        hex_of::<Md5>(parts)
    }

    fn hex_len(&self) -> usize {
        32
    }
}

pub struct Sha256Proof;

impl ProofDigest for Sha256Proof {
    fn hex_digest(&self, parts: &[&[u8]]) -> String {
        hex_of::<Sha256>(parts)
    }

    fn hex_len(&self) -> usize {
        64
    }
}

/// Verifies salted-hash proofs against the shared secret.
pub struct TokenAuthenticator {
    secret: String,
    digest: Box<dyn ProofDigest>,
}

impl TokenAuthenticator {
    pub fn new(secret: impl Into<String>, kind: DigestKind) -> Self {
        let digest: Box<dyn ProofDigest> = match kind {
            DigestKind::Md5 => Box::new(Md5Proof),
            DigestKind::Sha256 => Box::new(Sha256Proof),
        };
        Self::with_digest(secret, digest)
    }

    pub fn with_digest(secret: impl Into<String>, digest: Box<dyn ProofDigest>) -> Self {
        Self {
            secret: secret.into(),
            digest,
        }
    }

    /// Computes the proof hash a client should send for `subject` and `salt`.
    pub fn proof(&self, subject: &str, salt: &str) -> String {
        self.digest.hex_digest(&[
            self.secret.as_bytes(),
            subject.as_bytes(),
            salt.as_bytes(),
        ])
    }

    /// Builds the full credential string (`proof ‖ salt`).
    pub fn credential(&self, subject: &str, salt: &str) -> String {
        format!("{}{}", self.proof(subject, salt), salt)
    }

    /// Checks a client credential for `subject`.
    pub fn verify(&self, subject: &str, credential: &str) -> Result<(), AuthError> {
        let hash_len = self.digest.hex_len();
        if credential.len() <= hash_len || !credential.is_char_boundary(hash_len) {
            return Err(AuthError::CredentialTooShort);
        }

        let (hash, salt) = credential.split_at(hash_len);
        if self.proof(subject, salt) == hash {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

/// Generates the random token disclosed to a client at upgrade time.
pub fn disclose_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_matches_md5_of_concatenation() {
        let auth = TokenAuthenticator::new("s", DigestKind::Md5);
        let expected = hex::encode(Md5::digest(b"sTabc"));
        assert_eq!(auth.proof("T", "abc"), expected);
        assert_eq!(auth.credential("T", "abc"), format!("{expected}abc"));
    }

    #[test]
    fn test_verify_accepts_correct_proof() {
        let auth = TokenAuthenticator::new("s", DigestKind::Md5);
        let credential = auth.credential("T", "abc");
        assert!(auth.verify("T", &credential).is_ok());
    }

    #[test]
    fn test_verify_rejects_mismatch() {
        let auth = TokenAuthenticator::new("s", DigestKind::Md5);
        let credential = auth.credential("T", "abc");
        assert!(matches!(
            auth.verify("other", &credential),
            Err(AuthError::Mismatch)
        ));

        let tampered = format!("{}xyz", &credential[..32]);
        assert!(matches!(
            auth.verify("T", &tampered),
            Err(AuthError::Mismatch)
        ));
    }

    #[test]
    fn test_short_credential_rejected() {
        let auth = TokenAuthenticator::new("s", DigestKind::Md5);
        let bare_hash = auth.proof("T", "");
        assert_eq!(bare_hash.len(), 32);
        assert!(matches!(
            auth.verify("T", &bare_hash),
            Err(AuthError::CredentialTooShort)
        ));
        assert!(matches!(
            auth.verify("T", "abc"),
            Err(AuthError::CredentialTooShort)
        ));
    }

    #[test]
    fn test_sha256_digest_swaps_in() {
        let auth = TokenAuthenticator::new("s", DigestKind::Sha256);
        let credential = auth.credential("T", "abc");
        assert_eq!(credential.len(), 64 + 3);
        assert!(auth.verify("T", &credential).is_ok());
    }

    #[test]
    fn test_disclosed_tokens_are_fresh() {
        let a = disclose_token();
        let b = disclose_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
