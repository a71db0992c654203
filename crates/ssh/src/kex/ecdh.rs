//! `curve25519-sha256` key exchange (RFC 8731).
//!
//! Uses X25519 from `ring`. The shared secret is encoded as an `mpint` when
//! hashed, like the finite field methods.

use super::{parse_reply, KexContext, KexHash, KexOutput, KexStep, KeyExchange};
use crate::message::MessageType;
use crate::wire::SshBufMut;
use bytes::BufMut;
use fynx_platform::{FynxError, FynxResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use zeroize::Zeroizing;

/// Client side of `curve25519-sha256` and `curve25519-sha256@libssh.org`.
pub struct Curve25519 {
    name: &'static str,
    private_key: Option<EphemeralPrivateKey>,
    q_c: Vec<u8>,
    ctx: KexContext,
}

impl Curve25519 {
    /// Driver registered under `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            private_key: None,
            q_c: Vec::new(),
            ctx: KexContext::default(),
        }
    }
}

impl KeyExchange for Curve25519 {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&mut self, ctx: KexContext) -> FynxResult<Vec<u8>> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| FynxError::Security("Failed to generate X25519 key".to_string()))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| FynxError::Security("Failed to compute X25519 public key".to_string()))?;
        self.q_c = public_key.as_ref().to_vec();
        self.private_key = Some(private_key);
        self.ctx = ctx;

        let mut buf = Vec::with_capacity(37);
        buf.put_u8(MessageType::KexdhInit as u8);
        buf.put_string(&self.q_c);
        Ok(buf)
    }

    fn expected_message(&self) -> Option<u8> {
        self.private_key
            .as_ref()
            .map(|_| MessageType::KexdhReply as u8)
    }

    fn next(&mut self, payload: &[u8]) -> FynxResult<KexStep> {
        let private_key = self
            .private_key
            .take()
            .ok_or_else(|| FynxError::Protocol(format!("{}: unexpected message", self.name)))?;
        let (host_key, q_s, signature) = parse_reply(payload, MessageType::KexdhReply as u8)?;
        if q_s.len() != 32 {
            return Err(FynxError::Security(format!(
                "Invalid X25519 public key length: {}",
                q_s.len()
            )));
        }

        let peer = UnparsedPublicKey::new(&X25519, q_s);
        let k = agree_ephemeral(private_key, &peer, |material| {
            Zeroizing::new(material.to_vec())
        })
        .map_err(|_| FynxError::Security("Curve25519 key agreement failed".to_string()))?;
        if k.iter().all(|&b| b == 0) {
            return Err(FynxError::Security(
                "Curve25519 shared secret is all zero".to_string(),
            ));
        }

        let mut buf = self.ctx.hash_prefix();
        buf.put_string(host_key);
        buf.put_string(&self.q_c);
        buf.put_string(q_s);
        buf.put_mpint(&k);
        let exchange_hash = KexHash::Sha256.digest(&buf);

        Ok(KexStep::Done(KexOutput {
            shared_secret: k,
            exchange_hash,
            host_key: host_key.to_vec(),
            signature: signature.to_vec(),
            hash: KexHash::Sha256,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Reader;

    #[test]
    fn test_exchange_with_ring_peer() {
        let mut kex = Curve25519::new("curve25519-sha256");
        let init = kex.start(KexContext::default()).unwrap();
        assert_eq!(init[0], 30);
        assert_eq!(kex.expected_message(), Some(31));

        let mut r = Reader::new(&init[1..]);
        let q_c = r.string().unwrap().to_vec();
        assert_eq!(q_c.len(), 32);

        let rng = SystemRandom::new();
        let server = EphemeralPrivateKey::generate(&X25519, &rng).unwrap();
        let q_s = server.compute_public_key().unwrap().as_ref().to_vec();
        let expected = agree_ephemeral(server, &UnparsedPublicKey::new(&X25519, &q_c), |m| {
            m.to_vec()
        })
        .unwrap();

        let mut reply = vec![31u8];
        reply.put_string(b"host-key");
        reply.put_string(&q_s);
        reply.put_string(b"sig");
        let KexStep::Done(out) = kex.next(&reply).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(out.shared_secret.as_slice(), expected.as_slice());
        assert_eq!(out.exchange_hash.len(), 32);
        assert_eq!(kex.expected_message(), None);
    }

    #[test]
    fn test_rejects_bad_point_length() {
        let mut kex = Curve25519::new("curve25519-sha256");
        kex.start(KexContext::default()).unwrap();
        let mut reply = vec![31u8];
        reply.put_string(b"host-key");
        reply.put_string(&[1u8; 31]);
        reply.put_string(b"sig");
        assert!(matches!(kex.next(&reply), Err(FynxError::Security(_))));
    }
}
