//! Finite field Diffie-Hellman key exchange.
//!
//! - Fixed groups (RFC 4253 Section 8, RFC 8268): `diffie-hellman-group1-sha1`
//!   (Oakley group 2) and `diffie-hellman-group14-sha1` / `-sha256`.
//! - Group exchange (RFC 4419): the server picks the group after a
//!   `KEX_DH_GEX_REQUEST` bounded by [`GEX_MIN_BITS`] and [`GEX_MAX_BITS`].

use super::{parse_reply, KexContext, KexHash, KexOutput, KexStep, KeyExchange};
use crate::message::{MessageType, KEX_DH_GEX_GROUP, KEX_DH_GEX_INIT, KEX_DH_GEX_REPLY};
use crate::wire::{Reader, SshBufMut};
use bytes::BufMut;
use fynx_platform::{FynxError, FynxResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use zeroize::Zeroizing;

/// Smallest group accepted from a group exchange.
pub const GEX_MIN_BITS: u32 = 2048;
/// Preferred group size sent in the request.
pub const GEX_PREFERRED_BITS: u32 = 2048;
/// Largest group requested.
pub const GEX_MAX_BITS: u32 = 8192;

fn prime(hex_digits: &str) -> BigUint {
    let digits: String = hex_digits.split_whitespace().collect();
    BigUint::parse_bytes(digits.as_bytes(), 16).unwrap_or_default()
}

/// Oakley group 2 (1024-bit MODP), RFC 2409 Section 6.2.
pub static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381
         FFFFFFFFFFFFFFFF",
    )
});

/// 2048-bit MODP group 14, RFC 3526 Section 3.
pub static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F
         83655D23DCA3AD961C62F356208552BB9ED529077096966D
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    AwaitGroup,
    AwaitReply,
    Done,
}

/// Client side of a DH exchange over a fixed or negotiated group.
pub struct DiffieHellman {
    name: &'static str,
    hash: KexHash,
    group_exchange: bool,
    p: BigUint,
    g: BigUint,
    x: Option<Zeroizing<Vec<u8>>>,
    e: BigUint,
    ctx: KexContext,
    stage: Stage,
}

impl DiffieHellman {
    fn fixed(name: &'static str, hash: KexHash, p: &BigUint) -> Self {
        Self {
            name,
            hash,
            group_exchange: false,
            p: p.clone(),
            g: BigUint::from(2u32),
            x: None,
            e: BigUint::default(),
            ctx: KexContext::default(),
            stage: Stage::Idle,
        }
    }

    /// `diffie-hellman-group1-sha1`
    pub fn group1(name: &'static str) -> Self {
        Self::fixed(name, KexHash::Sha1, &GROUP1_P)
    }

    /// `diffie-hellman-group14-sha1` or `diffie-hellman-group14-sha256`
    pub fn group14(name: &'static str, hash: KexHash) -> Self {
        Self::fixed(name, hash, &GROUP14_P)
    }

    /// `diffie-hellman-group-exchange-sha1` or `-sha256`
    pub fn group_exchange(name: &'static str, hash: KexHash) -> Self {
        Self {
            group_exchange: true,
            ..Self::fixed(name, hash, &BigUint::default())
        }
    }

    /// Picks x in `[2, p-2]` and computes `e = g^x mod p`.
    fn generate(&mut self) -> FynxResult<()> {
        let two = BigUint::from(2u32);
        let upper = &self.p - 1u32;
        if upper <= two {
            return Err(FynxError::Security("DH group modulus too small".to_string()));
        }
        let x = rand::thread_rng().gen_biguint_range(&two, &upper);
        self.e = self.g.modpow(&x, &self.p);
        self.x = Some(Zeroizing::new(x.to_bytes_be()));
        Ok(())
    }

    fn init_message(&self, msg: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.p.bits() as usize / 8 + 16);
        buf.put_u8(msg);
        buf.put_mpint(&self.e.to_bytes_be());
        buf
    }

    /// Checks `1 < f < p-1` and computes `K = f^x mod p`.
    fn shared_secret(&self, f: &BigUint) -> FynxResult<Zeroizing<Vec<u8>>> {
        let one = BigUint::from(1u32);
        if *f <= one || *f >= &self.p - 1u32 {
            return Err(FynxError::Security(
                "Invalid DH public value from server".to_string(),
            ));
        }
        let x = self
            .x
            .as_ref()
            .ok_or_else(|| FynxError::Protocol("DH reply before init".to_string()))?;
        let x = BigUint::from_bytes_be(x);
        Ok(Zeroizing::new(f.modpow(&x, &self.p).to_bytes_be()))
    }

    fn on_group(&mut self, payload: &[u8]) -> FynxResult<KexStep> {
        let mut r = Reader::new(payload);
        r.u8()?;
        let p = BigUint::from_bytes_be(r.mpint()?);
        let g = BigUint::from_bytes_be(r.mpint()?);
        let bits = p.bits();
        if bits < u64::from(GEX_MIN_BITS) || bits > u64::from(GEX_MAX_BITS) {
            return Err(FynxError::Security(format!(
                "Server offered a {}-bit DH group outside [{}, {}]",
                bits, GEX_MIN_BITS, GEX_MAX_BITS
            )));
        }
        if g < BigUint::from(2u32) || g >= p {
            return Err(FynxError::Security("Invalid DH generator".to_string()));
        }
        tracing::debug!(bits, "Received DH group");
        self.p = p;
        self.g = g;
        self.generate()?;
        self.stage = Stage::AwaitReply;
        Ok(KexStep::Send(self.init_message(KEX_DH_GEX_INIT)))
    }

    fn on_reply(&mut self, payload: &[u8]) -> FynxResult<KexStep> {
        let expected = if self.group_exchange {
            KEX_DH_GEX_REPLY
        } else {
            MessageType::KexdhReply as u8
        };
        let (host_key, f, signature) = parse_reply(payload, expected)?;
        let f_bytes = f;
        let f = BigUint::from_bytes_be(f);
        let k = self.shared_secret(&f)?;

        let mut buf = self.ctx.hash_prefix();
        buf.put_string(host_key);
        if self.group_exchange {
            buf.put_u32(GEX_MIN_BITS);
            buf.put_u32(GEX_PREFERRED_BITS);
            buf.put_u32(GEX_MAX_BITS);
            buf.put_mpint(&self.p.to_bytes_be());
            buf.put_mpint(&self.g.to_bytes_be());
        }
        buf.put_mpint(&self.e.to_bytes_be());
        buf.put_mpint(f_bytes);
        buf.put_mpint(&k);
        let exchange_hash = self.hash.digest(&buf);

        self.x = None;
        self.stage = Stage::Done;
        Ok(KexStep::Done(KexOutput {
            shared_secret: k,
            exchange_hash,
            host_key: host_key.to_vec(),
            signature: signature.to_vec(),
            hash: self.hash,
        }))
    }
}

impl KeyExchange for DiffieHellman {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&mut self, ctx: KexContext) -> FynxResult<Vec<u8>> {
        self.ctx = ctx;
        if self.group_exchange {
            let mut buf = Vec::with_capacity(13);
            buf.put_u8(MessageType::KexDhGexRequest as u8);
            buf.put_u32(GEX_MIN_BITS);
            buf.put_u32(GEX_PREFERRED_BITS);
            buf.put_u32(GEX_MAX_BITS);
            self.stage = Stage::AwaitGroup;
            Ok(buf)
        } else {
            self.generate()?;
            self.stage = Stage::AwaitReply;
            Ok(self.init_message(MessageType::KexdhInit as u8))
        }
    }

    fn expected_message(&self) -> Option<u8> {
        match self.stage {
            Stage::AwaitGroup => Some(KEX_DH_GEX_GROUP),
            Stage::AwaitReply if self.group_exchange => Some(KEX_DH_GEX_REPLY),
            Stage::AwaitReply => Some(MessageType::KexdhReply as u8),
            Stage::Idle | Stage::Done => None,
        }
    }

    fn next(&mut self, payload: &[u8]) -> FynxResult<KexStep> {
        match self.stage {
            Stage::AwaitGroup => self.on_group(payload),
            Stage::AwaitReply => self.on_reply(payload),
            Stage::Idle | Stage::Done => Err(FynxError::Protocol(format!(
                "{}: unexpected key exchange message",
                self.name
            ))),
        }
    }
}
