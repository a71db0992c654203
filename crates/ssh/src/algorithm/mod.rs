//! Pluggable algorithm strategies and the name-to-factory registry.
//!
//! The transport never names a concrete primitive. After negotiation it asks
//! the [`AlgorithmRegistry`] for a fresh instance of whatever name won, one
//! instance per direction. Applications may register additional factories
//! before connecting; there is no process-wide registry.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::algorithm::{AlgorithmRegistry, CipherMode};
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! let mut cipher = registry.cipher("aes128-ctr").unwrap();
//! cipher.init(CipherMode::Encrypt, &[7u8; 16], &[0u8; 16]).unwrap();
//! assert_eq!(cipher.block_size(), 16);
//! ```

pub mod cipher;
pub mod compression;
pub mod mac;

use crate::hostkey::{self, SignatureVerifier};
use crate::kex::{self, KeyExchange};
use fynx_platform::{FynxError, FynxResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Direction a cipher instance is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Outbound
    Encrypt,
    /// Inbound
    Decrypt,
}

/// Symmetric cipher applied to whole packets (minus the MAC).
pub trait Cipher: Send {
    /// Negotiated name.
    fn name(&self) -> &str;

    /// Cipher block size; framing pads to a multiple of it.
    fn block_size(&self) -> usize;

    /// Bytes of IV the cipher consumes.
    fn iv_size(&self) -> usize;

    /// Bytes of key the cipher consumes.
    fn key_size(&self) -> usize;

    /// Keys the cipher. Longer key or IV material is truncated to size.
    fn init(&mut self, mode: CipherMode, key: &[u8], iv: &[u8]) -> FynxResult<()>;

    /// Encrypts or decrypts `data` in place, continuing the cipher stream.
    fn update(&mut self, data: &mut [u8]) -> FynxResult<()>;

    /// True for the null cipher.
    fn is_none(&self) -> bool {
        false
    }
}

/// Message authentication code over `sequence || packet`.
pub trait Mac: Send {
    /// Negotiated name.
    fn name(&self) -> &str;

    /// Bytes of key the MAC consumes.
    fn key_size(&self) -> usize;

    /// Length of the tag appended to each packet.
    fn output_size(&self) -> usize;

    /// Keys the MAC. Longer material is truncated to `key_size`.
    fn init(&mut self, key: &[u8]) -> FynxResult<()>;

    /// Computes the tag for one packet.
    fn compute(&self, sequence: u32, packet: &[u8]) -> FynxResult<Vec<u8>>;
}

/// Direction a compressor instance is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// Outbound
    Deflate,
    /// Inbound
    Inflate,
}

/// Stateful payload compressor. The stream spans all packets of a direction.
pub trait Compressor: Send {
    /// Compresses one payload.
    fn compress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>>;

    /// Decompresses one payload.
    fn decompress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>>;
}

/// Builds a cipher.
pub type CipherFactory = Arc<dyn Fn() -> Box<dyn Cipher> + Send + Sync>;
/// Builds a MAC.
pub type MacFactory = Arc<dyn Fn() -> Box<dyn Mac> + Send + Sync>;
/// Builds a compressor; `None` means the method does not transform payloads.
pub type CompressorFactory =
    Arc<dyn Fn(CompressionMode) -> FynxResult<Option<Box<dyn Compressor>>> + Send + Sync>;
/// Builds a key exchange driver.
pub type KexFactory = Arc<dyn Fn() -> Box<dyn KeyExchange> + Send + Sync>;

#[derive(Clone)]
struct CompressionEntry {
    factory: CompressorFactory,
    delayed: bool,
}

/// Maps negotiated algorithm names to factories.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    ciphers: HashMap<String, CipherFactory>,
    macs: HashMap<String, MacFactory>,
    compressions: HashMap<String, CompressionEntry>,
    kex: HashMap<String, KexFactory>,
    signatures: HashMap<String, Arc<dyn SignatureVerifier>>,
}

impl AlgorithmRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry populated with every bundled algorithm.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        cipher::register_defaults(&mut registry);
        mac::register_defaults(&mut registry);
        compression::register_defaults(&mut registry);
        kex::register_defaults(&mut registry);
        hostkey::register_defaults(&mut registry);
        registry
    }

    /// Registers (or replaces) a cipher.
    pub fn register_cipher<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Cipher> + Send + Sync + 'static,
    {
        self.ciphers.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Registers (or replaces) a MAC.
    pub fn register_mac<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Mac> + Send + Sync + 'static,
    {
        self.macs.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Registers (or replaces) a compression method.
    ///
    /// A `delayed` method only starts transforming payloads once user
    /// authentication has succeeded.
    pub fn register_compression<F>(&mut self, name: &str, delayed: bool, factory: F) -> &mut Self
    where
        F: Fn(CompressionMode) -> FynxResult<Option<Box<dyn Compressor>>> + Send + Sync + 'static,
    {
        self.compressions.insert(
            name.to_string(),
            CompressionEntry {
                factory: Arc::new(factory),
                delayed,
            },
        );
        self
    }

    /// Registers (or replaces) a key exchange method.
    pub fn register_kex<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn KeyExchange> + Send + Sync + 'static,
    {
        self.kex.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Registers (or replaces) a host key signature verifier.
    pub fn register_signature(
        &mut self,
        name: &str,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> &mut Self {
        self.signatures.insert(name.to_string(), verifier);
        self
    }

    /// Instantiates a cipher by name.
    pub fn cipher(&self, name: &str) -> FynxResult<Box<dyn Cipher>> {
        self.ciphers
            .get(name)
            .map(|f| f())
            .ok_or_else(|| unknown("cipher", name))
    }

    /// Instantiates a MAC by name.
    pub fn mac(&self, name: &str) -> FynxResult<Box<dyn Mac>> {
        self.macs
            .get(name)
            .map(|f| f())
            .ok_or_else(|| unknown("MAC", name))
    }

    /// Instantiates a compressor by name.
    pub fn compressor(
        &self,
        name: &str,
        mode: CompressionMode,
    ) -> FynxResult<Option<Box<dyn Compressor>>> {
        let entry = self
            .compressions
            .get(name)
            .ok_or_else(|| unknown("compression", name))?;
        (entry.factory)(mode)
    }

    /// True when the compression method waits for authentication.
    pub fn is_delayed_compression(&self, name: &str) -> bool {
        self.compressions.get(name).map_or(false, |e| e.delayed)
    }

    /// Instantiates a key exchange driver by name.
    pub fn kex(&self, name: &str) -> FynxResult<Box<dyn KeyExchange>> {
        self.kex
            .get(name)
            .map(|f| f())
            .ok_or_else(|| unknown("key exchange", name))
    }

    /// Looks up a host key signature verifier.
    pub fn signature(&self, name: &str) -> FynxResult<Arc<dyn SignatureVerifier>> {
        self.signatures
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("host key", name))
    }

    /// True when a cipher of this name can be built.
    pub fn has_cipher(&self, name: &str) -> bool {
        self.ciphers.contains_key(name)
    }

    /// True when a MAC of this name can be built.
    pub fn has_mac(&self, name: &str) -> bool {
        self.macs.contains_key(name)
    }

    /// True when a compression method of this name can be built.
    pub fn has_compression(&self, name: &str) -> bool {
        self.compressions.contains_key(name)
    }

    /// True when a key exchange of this name can be built.
    pub fn has_kex(&self, name: &str) -> bool {
        self.kex.contains_key(name)
    }

    /// True when a host key algorithm of this name can be verified.
    pub fn has_signature(&self, name: &str) -> bool {
        self.signatures.contains_key(name)
    }

    /// Checks that a cipher can actually be keyed, not only built.
    pub fn cipher_works(&self, name: &str) -> bool {
        let Ok(mut cipher) = self.cipher(name) else {
            return false;
        };
        let key = vec![0u8; cipher.key_size()];
        let iv = vec![0u8; cipher.iv_size()];
        let mut block = vec![0u8; cipher.block_size()];
        cipher.init(CipherMode::Encrypt, &key, &iv).is_ok() && cipher.update(&mut block).is_ok()
    }
}

fn unknown(kind: &str, name: &str) -> FynxError {
    FynxError::Negotiation(format!("No {} implementation for '{}'", kind, name))
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |m: Vec<&String>| {
            let mut v: Vec<String> = m.into_iter().cloned().collect();
            v.sort();
            v
        };
        f.debug_struct("AlgorithmRegistry")
            .field("ciphers", &names(self.ciphers.keys().collect()))
            .field("macs", &names(self.macs.keys().collect()))
            .field("compressions", &names(self.compressions.keys().collect()))
            .field("kex", &names(self.kex.keys().collect()))
            .field("signatures", &names(self.signatures.keys().collect()))
            .finish()
    }
}
