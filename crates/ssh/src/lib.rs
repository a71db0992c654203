//! SSH2 transport and connection engine for the Fynx security ecosystem.
//!
//! A client side implementation of the SSH protocol core:
//!
//! - **Transport** (RFC 4253): identification exchange, binary packet
//!   framing with per-direction cipher, MAC and compression, key exchange
//!   and rekeying
//! - **Authentication** (RFC 4252): `none` probing, pluggable method
//!   handlers, multi-factor partial success
//! - **Connection** (RFC 4254): multiplexed channels with credit based flow
//!   control, global requests, remote forwarding hooks
//!
//! Algorithms are resolved by name through an [`AlgorithmRegistry`]; the
//! bundled set covers AES-CTR/CBC, HMAC-SHA1/SHA2, zlib, Curve25519 and
//! finite field Diffie-Hellman, Ed25519 and RSA host keys.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::{PasswordAuth, Session};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> fynx_platform::FynxResult<()> {
//! let session = Session::builder("server.example.com", 22, "admin")
//!     .auth_handler(Arc::new(PasswordAuth::new("secret")))
//!     .build();
//! session.connect().await?;
//! let channel = session.open_session().await?;
//! channel.write(b"hello").await?;
//! channel.close().await?;
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Vetted primitives only (`ring`, RustCrypto, `dalek`)
//! - Constant-time MAC comparison
//! - Key material held in `zeroize` wrappers and never logged
//! - A `none` cipher is refused until authentication succeeds
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod algorithm;
pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod hostkey;
pub mod kex;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod session;
pub mod socket;
pub mod version;
pub mod wire;

pub use algorithm::{AlgorithmRegistry, Cipher, CipherMode, CompressionMode, Compressor, Mac};
pub use auth::{
    AuthContext, AuthDriver, AuthMethodHandler, AuthOutcome, AuthTransport, PasswordAuth,
    PublicKeyAuth,
};
pub use channel::{Channel, ChannelMessage};
pub use config::SessionConfig;
pub use hostkey::SignatureVerifier;
pub use kex::{KexCoordinator, KeyExchange};
pub use known_hosts::{
    HostKeyRepository, HostKeyStatus, MemoryHostKeyRepository, StrictHostKeyChecking, UserInfo,
};
pub use message::MessageType;
pub use packet::{PacketReader, PacketWriter};
pub use session::{ChannelOpenHandler, Session, SessionBuilder};
pub use socket::{SocketFactory, SshStream, TcpSocketFactory};
pub use version::Version;

/// Crate version, used in the default identification string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
