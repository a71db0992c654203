//! HMAC message authentication (RFC 4253 Section 6.4, RFC 6668).

use super::{AlgorithmRegistry, Mac};
use fynx_platform::{FynxError, FynxResult};
use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

pub(crate) fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register_mac("hmac-sha1", || Box::new(HmacMac::new(HmacHash::Sha1, None)))
        .register_mac("hmac-sha1-96", || {
            Box::new(HmacMac::new(HmacHash::Sha1, Some(12)))
        })
        .register_mac("hmac-sha2-256", || {
            Box::new(HmacMac::new(HmacHash::Sha256, None))
        })
        .register_mac("hmac-sha2-512", || {
            Box::new(HmacMac::new(HmacHash::Sha512, None))
        });
}

/// Digest underneath an HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacHash {
    /// SHA-1, 20 byte tag
    Sha1,
    /// SHA-256, 32 byte tag
    Sha256,
    /// SHA-512, 64 byte tag
    Sha512,
}

impl HmacHash {
    fn digest_size(self) -> usize {
        match self {
            HmacHash::Sha1 => 20,
            HmacHash::Sha256 => 32,
            HmacHash::Sha512 => 64,
        }
    }
}

#[derive(Clone)]
enum Keyed {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// HMAC keyed once per key exchange; each packet clones the keyed state.
pub struct HmacMac {
    hash: HmacHash,
    truncate: Option<usize>,
    keyed: Option<Keyed>,
}

impl HmacMac {
    /// Creates an unkeyed MAC, optionally truncating the tag (`-96` variants).
    pub fn new(hash: HmacHash, truncate: Option<usize>) -> Self {
        Self {
            hash,
            truncate,
            keyed: None,
        }
    }
}

impl Mac for HmacMac {
    fn name(&self) -> &str {
        match (self.hash, self.truncate) {
            (HmacHash::Sha1, None) => "hmac-sha1",
            (HmacHash::Sha1, Some(_)) => "hmac-sha1-96",
            (HmacHash::Sha256, _) => "hmac-sha2-256",
            (HmacHash::Sha512, _) => "hmac-sha2-512",
        }
    }

    fn key_size(&self) -> usize {
        self.hash.digest_size()
    }

    fn output_size(&self) -> usize {
        self.truncate.unwrap_or_else(|| self.hash.digest_size())
    }

    fn init(&mut self, key: &[u8]) -> FynxResult<()> {
        let size = self.key_size();
        if key.len() < size {
            return Err(FynxError::Security(format!(
                "{}: key material too short ({} of {})",
                self.name(),
                key.len(),
                size
            )));
        }
        let key = &key[..size];
        let bad = |_| FynxError::Security("Invalid HMAC key".to_string());
        self.keyed = Some(match self.hash {
            HmacHash::Sha1 => Keyed::Sha1(Hmac::new_from_slice(key).map_err(bad)?),
            HmacHash::Sha256 => Keyed::Sha256(Hmac::new_from_slice(key).map_err(bad)?),
            HmacHash::Sha512 => Keyed::Sha512(Hmac::new_from_slice(key).map_err(bad)?),
        });
        Ok(())
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> FynxResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let mut tag = match self.keyed.clone() {
            Some(Keyed::Sha1(mut m)) => {
                m.update(&seq);
                m.update(packet);
                m.finalize().into_bytes().to_vec()
            }
            Some(Keyed::Sha256(mut m)) => {
                m.update(&seq);
                m.update(packet);
                m.finalize().into_bytes().to_vec()
            }
            Some(Keyed::Sha512(mut m)) => {
                m.update(&seq);
                m.update(packet);
                m.finalize().into_bytes().to_vec()
            }
            None => {
                return Err(FynxError::Security(format!(
                    "{} used before init",
                    self.name()
                )))
            }
        };
        tag.truncate(self.output_size());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha1_known_answer() {
        // RFC 2202 test case 2 with the sequence number folded into the data:
        // "what do ya want for nothing?" split as seq bytes "what" + rest.
        let mut mac = HmacMac::new(HmacHash::Sha1, None);
        let mut key = b"Jefe".to_vec();
        key.resize(20, 0);
        mac.init(&key).unwrap();
        let seq = u32::from_be_bytes(*b"what");
        let tag = mac.compute(seq, b" do ya want for nothing?").unwrap();
        assert_eq!(hex::encode(tag), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn test_truncated_variant() {
        let mut mac = HmacMac::new(HmacHash::Sha1, Some(12));
        mac.init(&[1u8; 20]).unwrap();
        assert_eq!(mac.output_size(), 12);
        assert_eq!(mac.compute(0, b"x").unwrap().len(), 12);
        assert_eq!(mac.name(), "hmac-sha1-96");
    }

    #[test]
    fn test_sequence_changes_tag() {
        let mut mac = HmacMac::new(HmacHash::Sha256, None);
        mac.init(&[9u8; 32]).unwrap();
        assert_ne!(
            mac.compute(1, b"payload").unwrap(),
            mac.compute(2, b"payload").unwrap()
        );
    }

    #[test]
    fn test_short_key_and_unkeyed() {
        let mut mac = HmacMac::new(HmacHash::Sha512, None);
        assert!(mac.compute(0, b"x").is_err());
        assert!(mac.init(&[0u8; 32]).is_err());
    }
}
