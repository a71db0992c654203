//! SSH key exchange (RFC 4253 Section 7).
//!
//! This module covers:
//! - `SSH_MSG_KEXINIT` encoding and parsing, keeping the raw payloads that
//!   feed the exchange hash
//! - Algorithm negotiation (first client entry the server also lists)
//! - The [`KeyExchange`] driver interface implemented by [`dh`] and [`ecdh`]
//! - The [`KexCoordinator`] state machine and session key derivation
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. The negotiated method runs its own messages (DH, GEX or ECDH)
//! 4. The host key signature over H is verified, host key trust is checked
//! 5. Both sides send SSH_MSG_NEWKEYS; keys are derived and installed
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::kex::{negotiate_algorithm, KexInit};
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm(&client, &server), Some("aes256-ctr"));
//!
//! let kexinit = KexInit::new([
//!     vec!["curve25519-sha256".to_string()],
//!     vec!["ssh-ed25519".to_string()],
//!     vec!["aes128-ctr".to_string()],
//!     vec!["aes128-ctr".to_string()],
//!     vec!["hmac-sha2-256".to_string()],
//!     vec!["hmac-sha2-256".to_string()],
//!     vec!["none".to_string()],
//!     vec!["none".to_string()],
//!     vec![],
//!     vec![],
//! ]);
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20);
//! assert_eq!(KexInit::from_bytes(&bytes).unwrap(), kexinit);
//! ```

mod coordinator;
pub mod derive;
pub mod dh;
pub mod ecdh;

pub use coordinator::{KexCoordinator, KexProgress, KexState, NewKeys};

use crate::algorithm::AlgorithmRegistry;
use crate::message::MessageType;
use crate::wire::{Reader, SshBufMut};
use bytes::BufMut;
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use zeroize::Zeroizing;

pub(crate) fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register_kex("curve25519-sha256", || {
            Box::new(ecdh::Curve25519::new("curve25519-sha256"))
        })
        .register_kex("curve25519-sha256@libssh.org", || {
            Box::new(ecdh::Curve25519::new("curve25519-sha256@libssh.org"))
        })
        .register_kex("diffie-hellman-group-exchange-sha256", || {
            Box::new(dh::DiffieHellman::group_exchange(
                "diffie-hellman-group-exchange-sha256",
                KexHash::Sha256,
            ))
        })
        .register_kex("diffie-hellman-group-exchange-sha1", || {
            Box::new(dh::DiffieHellman::group_exchange(
                "diffie-hellman-group-exchange-sha1",
                KexHash::Sha1,
            ))
        })
        .register_kex("diffie-hellman-group14-sha256", || {
            Box::new(dh::DiffieHellman::group14("diffie-hellman-group14-sha256", KexHash::Sha256))
        })
        .register_kex("diffie-hellman-group14-sha1", || {
            Box::new(dh::DiffieHellman::group14("diffie-hellman-group14-sha1", KexHash::Sha1))
        })
        .register_kex("diffie-hellman-group1-sha1", || {
            Box::new(dh::DiffieHellman::group1("diffie-hellman-group1-sha1"))
        });
}

/// The ten negotiated categories, in KEXINIT order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Key exchange method
    Kex,
    /// Server host key algorithm
    HostKey,
    /// Encryption client to server
    CipherC2s,
    /// Encryption server to client
    CipherS2c,
    /// MAC client to server
    MacC2s,
    /// MAC server to client
    MacS2c,
    /// Compression client to server
    CompressionC2s,
    /// Compression server to client
    CompressionS2c,
    /// Language client to server
    LangC2s,
    /// Language server to client
    LangS2c,
}

impl Category {
    /// All categories in wire order.
    pub const ALL: [Category; 10] = [
        Category::Kex,
        Category::HostKey,
        Category::CipherC2s,
        Category::CipherS2c,
        Category::MacC2s,
        Category::MacS2c,
        Category::CompressionC2s,
        Category::CompressionS2c,
        Category::LangC2s,
        Category::LangS2c,
    ];

    /// Position in the KEXINIT name-list sequence.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human readable name used in errors and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Category::Kex => "kex",
            Category::HostKey => "server_host_key",
            Category::CipherC2s => "cipher.c2s",
            Category::CipherS2c => "cipher.s2c",
            Category::MacC2s => "mac.c2s",
            Category::MacS2c => "mac.s2c",
            Category::CompressionC2s => "compression.c2s",
            Category::CompressionS2c => "compression.s2c",
            Category::LangC2s => "lang.c2s",
            Category::LangS2c => "lang.s2c",
        }
    }

    fn is_language(self) -> bool {
        matches!(self, Category::LangC2s | Category::LangS2c)
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    lists: [Vec<String>; 10],
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie.
    pub fn new(lists: [Vec<String>; 10]) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            lists,
            first_kex_packet_follows: false,
        }
    }

    /// Random cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Name list for one category.
    pub fn list(&self, category: Category) -> &[String] {
        &self.lists[category.index()]
    }

    /// Whether a guessed KEX packet follows this message.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message, type byte included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for list in &self.lists {
            buf.put_name_list(list);
        }
        buf.put_bool(self.first_kex_packet_follows);
        // reserved
        buf.put_u32(0);
        buf
    }

    /// Parses a KEXINIT payload, type byte included.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        let msg = r.u8()?;
        if msg != MessageType::KexInit as u8 {
            return Err(FynxError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.bytes(16)?);

        let mut lists: [Vec<String>; 10] = Default::default();
        for list in lists.iter_mut() {
            *list = r.name_list()?;
        }
        let first_kex_packet_follows = r.bool()?;
        let _reserved = r.u32()?;

        Ok(Self {
            cookie,
            lists,
            first_kex_packet_follows,
        })
    }
}

/// First entry of `client` that also appears in `server`.
pub fn negotiate_algorithm<'a>(client: &'a [String], server: &[String]) -> Option<&'a str> {
    client
        .iter()
        .find(|c| server.iter().any(|s| s == *c))
        .map(String::as_str)
}

/// The winning algorithm per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmGuess {
    names: [String; 10],
}

impl AlgorithmGuess {
    /// Winner for one category. Languages resolve to `""` when none is shared.
    pub fn get(&self, category: Category) -> &str {
        &self.names[category.index()]
    }

    /// Key exchange method.
    pub fn kex(&self) -> &str {
        self.get(Category::Kex)
    }

    /// Host key algorithm.
    pub fn host_key(&self) -> &str {
        self.get(Category::HostKey)
    }

    /// Cipher for one direction.
    pub fn cipher(&self, outbound: bool) -> &str {
        self.get(if outbound {
            Category::CipherC2s
        } else {
            Category::CipherS2c
        })
    }

    /// MAC for one direction.
    pub fn mac(&self, outbound: bool) -> &str {
        self.get(if outbound {
            Category::MacC2s
        } else {
            Category::MacS2c
        })
    }

    /// Compression for one direction.
    pub fn compression(&self, outbound: bool) -> &str {
        self.get(if outbound {
            Category::CompressionC2s
        } else {
            Category::CompressionS2c
        })
    }

    /// Refuses the null cipher in either direction before authentication.
    pub fn check_cipher_policy(&self, authenticated: bool) -> FynxResult<()> {
        if authenticated {
            return Ok(());
        }
        if self.cipher(true) == "none" || self.cipher(false) == "none" {
            return Err(FynxError::Negotiation(
                "Cipher 'none' is not allowed before authentication".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for AlgorithmGuess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s={}/{}/{} s2c={}/{}/{}",
            self.kex(),
            self.host_key(),
            self.cipher(true),
            self.mac(true),
            self.compression(true),
            self.cipher(false),
            self.mac(false),
            self.compression(false),
        )
    }
}

/// Negotiates every category of a client and a server KEXINIT.
///
/// An empty intersection is fatal for every category except the languages.
pub fn negotiate(client: &KexInit, server: &KexInit) -> FynxResult<AlgorithmGuess> {
    let mut names: [String; 10] = Default::default();
    for category in Category::ALL {
        let winner = negotiate_algorithm(client.list(category), server.list(category));
        names[category.index()] = match winner {
            Some(name) => name.to_string(),
            None if category.is_language() => String::new(),
            None => {
                return Err(FynxError::Negotiation(format!(
                    "Algorithm negotiation fail: {} client=[{}] server=[{}]",
                    category.name(),
                    client.list(category).join(","),
                    server.list(category).join(",")
                )))
            }
        };
    }
    Ok(AlgorithmGuess { names })
}

/// Digest a key exchange method hashes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
            KexHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest length in bytes.
    pub fn output_size(self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha512 => 64,
        }
    }
}

/// Inputs common to every exchange hash.
#[derive(Debug, Clone, Default)]
pub struct KexContext {
    /// V_C, without CR LF
    pub client_version: String,
    /// V_S, without CR LF
    pub server_version: String,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: Vec<u8>,
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: Vec<u8>,
}

impl KexContext {
    /// `string V_C || string V_S || string I_C || string I_S`
    pub fn hash_prefix(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.client_kexinit.len() + self.server_kexinit.len() + 128,
        );
        buf.put_string(self.client_version.as_bytes());
        buf.put_string(self.server_version.as_bytes());
        buf.put_string(&self.client_kexinit);
        buf.put_string(&self.server_kexinit);
        buf
    }
}

/// Result of a completed key exchange method.
pub struct KexOutput {
    /// Shared secret K as an unsigned big-endian magnitude.
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash H.
    pub exchange_hash: Vec<u8>,
    /// K_S, the server's public host key blob.
    pub host_key: Vec<u8>,
    /// Server's signature over H.
    pub signature: Vec<u8>,
    /// Digest used for H and for key derivation.
    pub hash: KexHash,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput")
            .field("shared_secret", &"<redacted>")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("host_key_len", &self.host_key.len())
            .field("hash", &self.hash)
            .finish()
    }
}

/// One step of a key exchange method.
#[derive(Debug)]
pub enum KexStep {
    /// Send this payload and wait for [`KeyExchange::expected_message`].
    Send(Vec<u8>),
    /// The method is finished.
    Done(KexOutput),
}

/// Client side of a key exchange method, driven by the coordinator.
pub trait KeyExchange: Send {
    /// Negotiated method name.
    fn name(&self) -> &str;

    /// Starts the method and returns the first payload to send.
    fn start(&mut self, ctx: KexContext) -> FynxResult<Vec<u8>>;

    /// Message type the method waits for, `None` once finished.
    fn expected_message(&self) -> Option<u8>;

    /// Feeds the next server message to the method.
    fn next(&mut self, payload: &[u8]) -> FynxResult<KexStep>;
}

/// Parses the common `K_S || value || signature` server reply body.
pub(crate) fn parse_reply<'a>(
    payload: &'a [u8],
    expected: u8,
) -> FynxResult<(&'a [u8], &'a [u8], &'a [u8])> {
    let mut r = Reader::new(payload);
    let msg = r.u8()?;
    if msg != expected {
        return Err(FynxError::Protocol(format!(
            "Unexpected message {} during key exchange (expected {})",
            msg, expected
        )));
    }
    let host_key = r.string()?;
    let value = r.string()?;
    let signature = r.string()?;
    Ok((host_key, value, signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn kexinit(cipher: &[&str], lang: &[&str]) -> KexInit {
        KexInit::new([
            strings(&["curve25519-sha256", "diffie-hellman-group14-sha1"]),
            strings(&["ssh-ed25519", "ssh-rsa"]),
            strings(cipher),
            strings(cipher),
            strings(&["hmac-sha2-256"]),
            strings(&["hmac-sha2-256"]),
            strings(&["none"]),
            strings(&["none"]),
            strings(lang),
            strings(lang),
        ])
    }

    #[test]
    fn test_negotiate_algorithm_client_preference() {
        let client = strings(&["a", "b", "c"]);
        let server = strings(&["c", "b"]);
        assert_eq!(negotiate_algorithm(&client, &server), Some("b"));
        assert_eq!(negotiate_algorithm(&client, &strings(&["x"])), None);
        assert_eq!(negotiate_algorithm(&[], &server), None);
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = kexinit(&["aes128-ctr", "aes256-ctr"], &[]);
        let bytes = original.to_bytes();
        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.list(Category::CipherS2c), ["aes128-ctr", "aes256-ctr"]);
        assert!(parsed.list(Category::LangC2s).is_empty());
    }

    #[test]
    fn test_kexinit_parse_errors() {
        assert!(KexInit::from_bytes(&[]).is_err());
        assert!(KexInit::from_bytes(&[21, 0, 0]).is_err());
        let bytes = kexinit(&["aes128-ctr"], &[]).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_negotiate_full() {
        let client = kexinit(&["aes256-ctr", "aes128-ctr"], &[]);
        let server = KexInit::new([
            strings(&["diffie-hellman-group14-sha1"]),
            strings(&["ssh-rsa"]),
            strings(&["aes128-ctr", "aes256-ctr"]),
            strings(&["aes128-ctr"]),
            strings(&["hmac-sha1", "hmac-sha2-256"]),
            strings(&["hmac-sha2-256"]),
            strings(&["none", "zlib"]),
            strings(&["none"]),
            strings(&["en"]),
            strings(&[]),
        ]);
        let guess = negotiate(&client, &server).unwrap();
        assert_eq!(guess.kex(), "diffie-hellman-group14-sha1");
        assert_eq!(guess.host_key(), "ssh-rsa");
        assert_eq!(guess.cipher(true), "aes256-ctr");
        assert_eq!(guess.cipher(false), "aes128-ctr");
        assert_eq!(guess.mac(true), "hmac-sha2-256");
        assert_eq!(guess.compression(false), "none");
        assert_eq!(guess.get(Category::LangC2s), "");
    }

    #[test]
    fn test_negotiate_empty_intersection_is_fatal() {
        let client = kexinit(&["aes128-ctr"], &[]);
        let server = kexinit(&["aes256-cbc"], &[]);
        let err = negotiate(&client, &server).unwrap_err();
        assert!(matches!(err, FynxError::Negotiation(_)));
        assert!(err.to_string().contains("cipher.c2s"));
    }

    #[test]
    fn test_none_cipher_refused_before_auth() {
        let client = kexinit(&["none"], &[]);
        let guess = negotiate(&client, &client).unwrap();
        assert!(matches!(
            guess.check_cipher_policy(false),
            Err(FynxError::Negotiation(_))
        ));
        assert!(guess.check_cipher_policy(true).is_ok());
    }

    #[test]
    fn test_kex_hash_sizes() {
        for hash in [KexHash::Sha1, KexHash::Sha256, KexHash::Sha512] {
            assert_eq!(hash.digest(b"abc").len(), hash.output_size());
        }
        assert_eq!(
            hex::encode(KexHash::Sha1.digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_parse_reply_checks_type() {
        let mut payload = vec![31u8];
        payload.put_string(b"key");
        payload.put_string(b"f");
        payload.put_string(b"sig");
        let (k, f, s) = parse_reply(&payload, 31).unwrap();
        assert_eq!((k, f, s), (&b"key"[..], &b"f"[..], &b"sig"[..]));
        assert!(parse_reply(&payload, 33).is_err());
    }
}
