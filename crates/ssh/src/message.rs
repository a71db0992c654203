//! SSH message numbers (RFC 4250 Section 4.1) and the reason codes carried by
//! disconnect and channel-open-failure messages.
//!
//! Numbers 30 to 49 are reused by different key exchange methods, so the
//! group-exchange aliases are exposed as plain constants next to the enum.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::message::MessageType;
//!
//! let msg = MessageType::from_u8(94).unwrap();
//! assert_eq!(msg, MessageType::ChannelData);
//! assert_eq!(msg.to_string(), "SSH_MSG_CHANNEL_DATA(94)");
//! ```

use crate::wire::{Reader, SshBufMut};
use bytes::BufMut;
use fynx_platform::FynxResult;

/// SSH message types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver.
    Ignore = 2,
    /// Reply to a message number the peer did not understand.
    Unimplemented = 3,
    /// Debugging text.
    Debug = 4,
    /// Service request (`ssh-userauth`).
    ServiceRequest = 5,
    /// Service accepted.
    ServiceAccept = 6,

    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the freshly derived keys.
    NewKeys = 21,

    /// DH / ECDH init (also `KEX_DH_GEX_REQUEST_OLD`).
    KexdhInit = 30,
    /// DH / ECDH reply (also `KEX_DH_GEX_GROUP`).
    KexdhReply = 31,
    /// Group exchange init.
    KexDhGexInit = 32,
    /// Group exchange reply.
    KexDhGexReply = 33,
    /// Group exchange request.
    KexDhGexRequest = 34,

    /// Authentication request.
    UserauthRequest = 50,
    /// Authentication failure, with the methods that can continue.
    UserauthFailure = 51,
    /// Authentication success.
    UserauthSuccess = 52,
    /// Pre-authentication banner.
    UserauthBanner = 53,
    /// Method specific (`PK_OK`, `PASSWD_CHANGEREQ`, `INFO_REQUEST`).
    UserauthPkOk = 60,

    /// Global request.
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request failed.
    RequestFailure = 82,

    /// Open a channel.
    ChannelOpen = 90,
    /// Channel open accepted.
    ChannelOpenConfirmation = 91,
    /// Channel open refused.
    ChannelOpenFailure = 92,
    /// Add send credit.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Typed channel data (stderr).
    ChannelExtendedData = 95,
    /// No more data in this direction.
    ChannelEof = 96,
    /// Channel closed.
    ChannelClose = 97,
    /// Channel specific request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

/// `SSH_MSG_KEX_DH_GEX_GROUP`, shares its number with `SSH_MSG_KEXDH_REPLY`.
pub const KEX_DH_GEX_GROUP: u8 = 31;
/// `SSH_MSG_KEX_DH_GEX_INIT`.
pub const KEX_DH_GEX_INIT: u8 = 32;
/// `SSH_MSG_KEX_DH_GEX_REPLY`.
pub const KEX_DH_GEX_REPLY: u8 = 33;
/// `SSH_MSG_KEX_DH_GEX_REQUEST`.
pub const KEX_DH_GEX_REQUEST: u8 = 34;
/// `SSH_MSG_USERAUTH_PASSWD_CHANGEREQ`, shares its number with `PK_OK`.
pub const USERAUTH_PASSWD_CHANGEREQ: u8 = 60;

impl MessageType {
    /// Converts a wire byte into a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            32 => KexDhGexInit,
            33 => KexDhGexReply,
            34 => KexDhGexRequest,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        })
    }

    /// RFC name of the message.
    pub fn name(&self) -> &'static str {
        use MessageType::*;
        match self {
            Disconnect => "SSH_MSG_DISCONNECT",
            Ignore => "SSH_MSG_IGNORE",
            Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            Debug => "SSH_MSG_DEBUG",
            ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            KexInit => "SSH_MSG_KEXINIT",
            NewKeys => "SSH_MSG_NEWKEYS",
            KexdhInit => "SSH_MSG_KEXDH_INIT",
            KexdhReply => "SSH_MSG_KEXDH_REPLY",
            KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            ChannelData => "SSH_MSG_CHANNEL_DATA",
            ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            ChannelEof => "SSH_MSG_CHANNEL_EOF",
            ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// True for the key exchange method range (30 to 49).
pub fn is_kex_method(msg: u8) -> bool {
    (30..=49).contains(&msg)
}

/// True for messages that may be written while a key exchange is running.
///
/// Everything else waits until the new keys are in place.
pub fn bypasses_kex_stall(msg: u8) -> bool {
    msg == MessageType::KexInit as u8
        || msg == MessageType::NewKeys as u8
        || msg == MessageType::Disconnect as u8
        || (30..=34).contains(&msg)
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect {
    /// Host not allowed to connect.
    pub const HOST_NOT_ALLOWED_TO_CONNECT: u32 = 1;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error.
    pub const MAC_ERROR: u32 = 5;
    /// Compression error.
    pub const COMPRESSION_ERROR: u32 = 6;
    /// Service not available.
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// Protocol version not supported.
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u32 = 8;
    /// Host key not verifiable.
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Connection lost.
    pub const CONNECTION_LOST: u32 = 10;
    /// Disconnected by application.
    pub const BY_APPLICATION: u32 = 11;
    /// No more authentication methods available.
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`
    AdministrativelyProhibited = 1,
    /// `SSH_OPEN_CONNECT_FAILED`
    ConnectFailed = 2,
    /// `SSH_OPEN_UNKNOWN_CHANNEL_TYPE`
    UnknownChannelType = 3,
    /// `SSH_OPEN_RESOURCE_SHORTAGE`
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Maps a wire code, `None` for codes outside RFC 4254.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Description used when the peer sent none.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code, see [`disconnect`].
    pub reason_code: u32,
    /// Human readable text.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl Disconnect {
    /// Disconnect with an English description.
    pub fn new(reason_code: u32, description: &str) -> Self {
        Self {
            reason_code,
            description: description.to_string(),
            language: "en".to_string(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + self.description.len());
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        buf.put_string(self.description.as_bytes());
        buf.put_string(self.language.as_bytes());
        buf
    }

    /// Parses the message. The language tag may be missing.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        r.u8()?;
        let reason_code = r.u32()?;
        let description = r.utf8()?;
        let language = if r.remaining() > 0 {
            r.utf8()?
        } else {
            String::new()
        };
        Ok(Self {
            reason_code,
            description,
            language,
        })
    }
}

/// SSH_MSG_DEBUG text, if it parses.
pub fn debug_message(data: &[u8]) -> Option<(bool, String)> {
    let mut r = Reader::new(data);
    r.u8().ok()?;
    let always_display = r.bool().ok()?;
    Some((always_display, r.utf8().ok()?))
}

/// Sequence number rejected by an SSH_MSG_UNIMPLEMENTED.
pub fn unimplemented_sequence(data: &[u8]) -> Option<u32> {
    let mut r = Reader::new(data);
    r.u8().ok()?;
    r.u32().ok()
}

/// SSH_MSG_IGNORE carrying an empty string.
pub fn ignore_message() -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.put_u8(MessageType::Ignore as u8);
    buf.put_string(&[]);
    buf
}
