//! Host key signature verification (RFC 4253 Section 6.6, RFC 8332, RFC 8709).
//!
//! A key exchange ends with the server signing the exchange hash. The
//! verifier registered under the negotiated host key algorithm checks that
//! signature against the public key blob the server sent.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519`
//! - `rsa-sha2-256`, `rsa-sha2-512`
//! - `ssh-rsa` (SHA-1, legacy)

use crate::algorithm::AlgorithmRegistry;
use crate::wire::Reader;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use fynx_platform::{FynxError, FynxResult};
use ring::signature::{
    RsaParameters, RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub(crate) fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register_signature("ssh-ed25519", Arc::new(Ed25519Verifier))
        .register_signature("rsa-sha2-256", Arc::new(RsaVerifier::new(RsaHash::Sha256)))
        .register_signature("rsa-sha2-512", Arc::new(RsaVerifier::new(RsaHash::Sha512)))
        .register_signature("ssh-rsa", Arc::new(RsaVerifier::new(RsaHash::Sha1)));
}

/// Checks a host key signature over the exchange hash.
pub trait SignatureVerifier: Send + Sync {
    /// `public_key` is the SSH public key blob, `signature` the SSH signature
    /// blob. `Ok(false)` means a well-formed but wrong signature.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> FynxResult<bool>;
}

/// Key type named inside a public key blob (`ssh-rsa`, `ssh-ed25519`, ...).
pub fn key_type(public_key: &[u8]) -> FynxResult<String> {
    Reader::new(public_key).utf8()
}

/// OpenSSH style fingerprint: `SHA256:` followed by unpadded base64.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

fn split_signature<'a>(signature: &'a [u8], expected: &str) -> FynxResult<&'a [u8]> {
    let mut r = Reader::new(signature);
    let name = r.string()?;
    if name != expected.as_bytes() {
        return Err(FynxError::Security(format!(
            "Signature algorithm mismatch: expected {}, got {}",
            expected,
            String::from_utf8_lossy(name)
        )));
    }
    r.string()
}

/// `ssh-ed25519`
#[derive(Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> FynxResult<bool> {
        let mut r = Reader::new(public_key);
        if r.string()? != b"ssh-ed25519" {
            return Err(FynxError::Security("Not an ssh-ed25519 key".to_string()));
        }
        let key: [u8; 32] = r
            .string()?
            .try_into()
            .map_err(|_| FynxError::Security("Ed25519 key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key)
            .map_err(|e| FynxError::Security(format!("Invalid Ed25519 key: {}", e)))?;

        let sig = split_signature(signature, "ssh-ed25519")?;
        let sig = Signature::from_slice(sig)
            .map_err(|e| FynxError::Security(format!("Invalid Ed25519 signature: {}", e)))?;
        Ok(key.verify(data, &sig).is_ok())
    }
}

/// Digest used by an RSA signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaHash {
    /// `ssh-rsa`
    Sha1,
    /// `rsa-sha2-256`
    Sha256,
    /// `rsa-sha2-512`
    Sha512,
}

impl RsaHash {
    fn signature_name(self) -> &'static str {
        match self {
            RsaHash::Sha1 => "ssh-rsa",
            RsaHash::Sha256 => "rsa-sha2-256",
            RsaHash::Sha512 => "rsa-sha2-512",
        }
    }

    fn parameters(self) -> &'static RsaParameters {
        match self {
            RsaHash::Sha1 => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            RsaHash::Sha256 => &RSA_PKCS1_2048_8192_SHA256,
            RsaHash::Sha512 => &RSA_PKCS1_2048_8192_SHA512,
        }
    }
}

/// PKCS#1 v1.5 RSA over an `ssh-rsa` public key blob.
#[derive(Debug)]
pub struct RsaVerifier {
    hash: RsaHash,
}

impl RsaVerifier {
    /// Verifier for one signature flavour.
    pub fn new(hash: RsaHash) -> Self {
        Self { hash }
    }
}

fn strip_zeros(mut v: &[u8]) -> &[u8] {
    while let [0, rest @ ..] = v {
        v = rest;
    }
    v
}

impl SignatureVerifier for RsaVerifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> FynxResult<bool> {
        let mut r = Reader::new(public_key);
        if r.string()? != b"ssh-rsa" {
            return Err(FynxError::Security("Not an ssh-rsa key".to_string()));
        }
        let e = strip_zeros(r.mpint()?);
        let n = strip_zeros(r.mpint()?);

        let sig = split_signature(signature, self.hash.signature_name())?;
        if sig.len() > n.len() {
            return Ok(false);
        }
        let mut padded = vec![0u8; n.len() - sig.len()];
        padded.extend_from_slice(sig);

        let components = RsaPublicKeyComponents { n, e };
        Ok(components
            .verify(self.hash.parameters(), data, &padded)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SshBufMut;
    use ed25519_dalek::{Signer, SigningKey};

    fn ed25519_blobs(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let mut key = Vec::new();
        key.put_string(b"ssh-ed25519");
        key.put_string(signing.verifying_key().as_bytes());
        let mut sig = Vec::new();
        sig.put_string(b"ssh-ed25519");
        sig.put_string(&signing.sign(data).to_bytes());
        (key, sig)
    }

    #[test]
    fn test_ed25519_verify() {
        let (key, sig) = ed25519_blobs(b"exchange hash");
        assert!(Ed25519Verifier.verify(&key, b"exchange hash", &sig).unwrap());
        assert!(!Ed25519Verifier.verify(&key, b"other hash", &sig).unwrap());
    }

    #[test]
    fn test_signature_name_mismatch() {
        let (key, _) = ed25519_blobs(b"h");
        let mut sig = Vec::new();
        sig.put_string(b"ssh-rsa");
        sig.put_string(&[0u8; 64]);
        assert!(matches!(
            Ed25519Verifier.verify(&key, b"h", &sig),
            Err(FynxError::Security(_))
        ));
    }

    #[test]
    fn test_rsa_rejects_non_rsa_blob() {
        let (key, sig) = ed25519_blobs(b"h");
        assert!(RsaVerifier::new(RsaHash::Sha1)
            .verify(&key, b"h", &sig)
            .is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let (key, _) = ed25519_blobs(b"h");
        let fp = fingerprint(&key);
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert_eq!(key_type(&key).unwrap(), "ssh-ed25519");
    }

    #[test]
    fn test_strip_zeros() {
        assert_eq!(strip_zeros(&[0, 0, 1, 0]), &[1, 0]);
        assert_eq!(strip_zeros(&[0]), &[] as &[u8]);
    }
}
