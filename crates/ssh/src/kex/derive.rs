//! Session key derivation (RFC 4253 Section 7.2).
//!
//! The six secrets come out of one buffer `mpint(K) || H || tag || session_id`
//! whose tag byte is bumped from `'A'` to `'F'` between digests. Material
//! shorter than a cipher or MAC needs is extended with
//! `HASH(mpint(K) || H || material so far)`.

use super::KexHash;
use crate::wire::encode_mpint;
use std::fmt;
use zeroize::Zeroizing;

/// The six secrets of one key exchange, as first derived (one digest each).
pub struct SessionKeys {
    /// `'A'` initial IV client to server
    pub iv_c2s: Zeroizing<Vec<u8>>,
    /// `'B'` initial IV server to client
    pub iv_s2c: Zeroizing<Vec<u8>>,
    /// `'C'` encryption key client to server
    pub enc_c2s: Zeroizing<Vec<u8>>,
    /// `'D'` encryption key server to client
    pub enc_s2c: Zeroizing<Vec<u8>>,
    /// `'E'` integrity key client to server
    pub mac_c2s: Zeroizing<Vec<u8>>,
    /// `'F'` integrity key server to client
    pub mac_s2c: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys { <redacted> }")
    }
}

/// Derives keys from `K` (unsigned magnitude), `H` and the session id.
pub struct KeyDeriver {
    hash: KexHash,
    k_mpint: Zeroizing<Vec<u8>>,
    exchange_hash: Vec<u8>,
}

impl KeyDeriver {
    /// Prepares derivation for one completed exchange.
    pub fn new(hash: KexHash, shared_secret: &[u8], exchange_hash: &[u8]) -> Self {
        Self {
            hash,
            k_mpint: Zeroizing::new(encode_mpint(shared_secret)),
            exchange_hash: exchange_hash.to_vec(),
        }
    }

    /// Runs the chained derivation of the six secrets.
    pub fn derive(&self, session_id: &[u8]) -> SessionKeys {
        let mut buf = Zeroizing::new(Vec::with_capacity(
            self.k_mpint.len() + self.exchange_hash.len() + 1 + session_id.len(),
        ));
        buf.extend_from_slice(&self.k_mpint);
        buf.extend_from_slice(&self.exchange_hash);
        let tag = buf.len();
        buf.push(b'A');
        buf.extend_from_slice(session_id);

        let mut next = || {
            let out = Zeroizing::new(self.hash.digest(&buf));
            buf[tag] += 1;
            out
        };

        SessionKeys {
            iv_c2s: next(),
            iv_s2c: next(),
            enc_c2s: next(),
            enc_s2c: next(),
            mac_c2s: next(),
            mac_s2c: next(),
        }
    }

    /// Extends `material` to at least `required` bytes.
    pub fn extend(&self, material: &[u8], required: usize) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(material.to_vec());
        while key.len() < required {
            let mut buf = Zeroizing::new(Vec::with_capacity(
                self.k_mpint.len() + self.exchange_hash.len() + key.len(),
            ));
            buf.extend_from_slice(&self.k_mpint);
            buf.extend_from_slice(&self.exchange_hash);
            buf.extend_from_slice(&key);
            let more = self.hash.digest(&buf);
            key.extend_from_slice(&more);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(hash: KexHash, k: &[u8], h: &[u8], tag: u8, sid: &[u8]) -> Vec<u8> {
        let mut buf = encode_mpint(k);
        buf.extend_from_slice(h);
        buf.push(tag);
        buf.extend_from_slice(sid);
        hash.digest(&buf)
    }

    #[test]
    fn test_each_secret_matches_its_tag() {
        let k = [0x80u8, 1, 2, 3];
        let h = [9u8; 20];
        let sid = [7u8; 20];
        let keys = KeyDeriver::new(KexHash::Sha1, &k, &h).derive(&sid);

        let all = [
            (&keys.iv_c2s, b'A'),
            (&keys.iv_s2c, b'B'),
            (&keys.enc_c2s, b'C'),
            (&keys.enc_s2c, b'D'),
            (&keys.mac_c2s, b'E'),
            (&keys.mac_s2c, b'F'),
        ];
        for (secret, tag) in all {
            assert_eq!(secret.as_slice(), single(KexHash::Sha1, &k, &h, tag, &sid));
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = KeyDeriver::new(KexHash::Sha256, &[5u8; 32], &[1u8; 32]).derive(&[2u8; 32]);
        let b = KeyDeriver::new(KexHash::Sha256, &[5u8; 32], &[1u8; 32]).derive(&[2u8; 32]);
        assert_eq!(a.enc_c2s.as_slice(), b.enc_c2s.as_slice());
        assert_eq!(a.mac_s2c.as_slice(), b.mac_s2c.as_slice());
        assert_ne!(a.enc_c2s.as_slice(), a.enc_s2c.as_slice());

        let other_sid = KeyDeriver::new(KexHash::Sha256, &[5u8; 32], &[1u8; 32]).derive(&[3u8; 32]);
        assert_ne!(a.iv_c2s.as_slice(), other_sid.iv_c2s.as_slice());
    }

    #[test]
    fn test_extend_appends_hash_of_material() {
        let k = [1u8, 2, 3];
        let h = [4u8; 20];
        let deriver = KeyDeriver::new(KexHash::Sha1, &k, &h);
        let keys = deriver.derive(&h);

        let long = deriver.extend(&keys.enc_c2s, 32);
        assert_eq!(long.len(), 40);
        assert_eq!(&long[..20], keys.enc_c2s.as_slice());

        let mut buf = encode_mpint(&k);
        buf.extend_from_slice(&h);
        buf.extend_from_slice(&keys.enc_c2s);
        assert_eq!(&long[20..], KexHash::Sha1.digest(&buf).as_slice());

        let short = deriver.extend(&keys.enc_c2s, 16);
        assert_eq!(short.as_slice(), keys.enc_c2s.as_slice());
    }
}
