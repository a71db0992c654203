//! SSH connection protocol messages (RFC 4254).
//!
//! One struct per message, each with `to_bytes` (type byte included) and
//! `from_bytes`. Channel and request semantics live in [`crate::channel`] and
//! [`crate::session`]; this module is only the wire format.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::connection::ChannelOpen;
//!
//! let open = ChannelOpen::new("session", 0, 1048576, 16384);
//! let bytes = open.to_bytes();
//! assert_eq!(bytes[0], 90);
//! assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
//! ```

use crate::message::MessageType;
use crate::wire::{Reader, SshBufMut};
use bytes::BufMut;
use fynx_platform::{FynxError, FynxResult};

/// Channel types a peer may open towards us, when enabled.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";
/// X11 forwarding channel type.
pub const X11: &str = "x11";
/// Agent forwarding channel type.
pub const AUTH_AGENT: &str = "auth-agent@openssh.com";

/// `SSH_EXTENDED_DATA_STDERR`
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn reader_for(data: &[u8], expected: MessageType) -> FynxResult<Reader<'_>> {
    let mut r = Reader::new(data);
    let msg = r.u8()?;
    if msg != expected as u8 {
        return Err(FynxError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, msg
        )));
    }
    Ok(r)
}

/// Recipient channel of any channel message (types 91 to 100).
pub fn recipient_channel(data: &[u8]) -> FynxResult<u32> {
    let mut r = Reader::new(data);
    r.u8()?;
    r.u32()
}

/// SSH_MSG_CHANNEL_OPEN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name.
    pub channel_type: String,
    /// Opener's channel number.
    pub sender_channel: u32,
    /// Opener's receive window.
    pub initial_window_size: u32,
    /// Largest packet the opener accepts.
    pub maximum_packet_size: u32,
    /// Type specific data.
    pub extra: Vec<u8>,
}

impl ChannelOpen {
    /// Open request without type specific data.
    pub fn new(
        channel_type: &str,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            extra: Vec::new(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.channel_type.len() + self.extra.len());
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_string(self.channel_type.as_bytes());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.put_slice(&self.extra);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.utf8()?,
            sender_channel: r.u32()?,
            initial_window_size: r.u32()?,
            maximum_packet_size: r.u32()?,
            extra: r.rest().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number.
    pub recipient_channel: u32,
    /// Peer's channel number.
    pub sender_channel: u32,
    /// Peer's receive window.
    pub initial_window_size: u32,
    /// Largest packet the peer accepts.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            sender_channel: r.u32()?,
            initial_window_size: r.u32()?,
            maximum_packet_size: r.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Opener's channel number.
    pub recipient_channel: u32,
    /// Reason code, see [`crate::message::OpenFailureReason`].
    pub reason_code: u32,
    /// Human readable text.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl ChannelOpenFailure {
    /// Failure with an empty description.
    pub fn new(recipient_channel: u32, reason_code: u32) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: String::new(),
            language: String::new(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17 + self.description.len());
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        buf.put_string(self.description.as_bytes());
        buf.put_string(self.language.as_bytes());
        buf
    }

    /// Parses the message. Language is optional on input.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.u32()?;
        let reason_code = r.u32()?;
        let description = r.utf8()?;
        let language = if r.remaining() > 0 {
            r.utf8()?
        } else {
            String::new()
        };
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Channel number on the receiving side.
    pub recipient_channel: u32,
    /// Credit added.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            bytes_to_add: r.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA and SSH_MSG_CHANNEL_EXTENDED_DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number on the receiving side.
    pub recipient_channel: u32,
    /// `Some(code)` for extended data.
    pub data_type: Option<u32>,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Header bytes in front of the data (type, recipient, length).
    pub const HEADER_LEN: usize = 9;

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(self.recipient_channel, self.data_type, &self.data)
    }

    /// Parses either data message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        let msg = r.u8()?;
        let recipient_channel = r.u32()?;
        let data_type = match msg {
            m if m == MessageType::ChannelData as u8 => None,
            m if m == MessageType::ChannelExtendedData as u8 => Some(r.u32()?),
            m => {
                return Err(FynxError::Protocol(format!(
                    "Invalid message type: expected channel data, got {}",
                    m
                )))
            }
        };
        Ok(Self {
            recipient_channel,
            data_type,
            data: r.string()?.to_vec(),
        })
    }
}

/// Encodes a data message without an intermediate [`ChannelData`].
pub fn encode_data(recipient_channel: u32, data_type: Option<u32>, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ChannelData::HEADER_LEN + 4 + data.len());
    match data_type {
        None => {
            buf.put_u8(MessageType::ChannelData as u8);
            buf.put_u32(recipient_channel);
        }
        Some(code) => {
            buf.put_u8(MessageType::ChannelExtendedData as u8);
            buf.put_u32(recipient_channel);
            buf.put_u32(code);
        }
    }
    buf.put_string(data);
    buf
}

/// Messages carrying nothing but the recipient channel:
/// EOF, CLOSE, SUCCESS and FAILURE.
pub fn encode_channel_only(msg: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.put_u8(msg as u8);
    buf.put_u32(recipient_channel);
    buf
}

/// SSH_MSG_CHANNEL_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Channel number on the receiving side.
    pub recipient_channel: u32,
    /// Request name (`exec`, `exit-status`, ...).
    pub request_type: String,
    /// Whether SUCCESS/FAILURE is expected.
    pub want_reply: bool,
    /// Request specific data.
    pub data: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.request_type.len() + self.data.len());
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_string(self.request_type.as_bytes());
        buf.put_bool(self.want_reply);
        buf.put_slice(&self.data);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::ChannelRequest)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            request_type: r.utf8()?,
            want_reply: r.bool()?,
            data: r.rest().to_vec(),
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name.
    pub name: String,
    /// Whether SUCCESS/FAILURE is expected.
    pub want_reply: bool,
    /// Request specific data.
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.name.len() + self.data.len());
        buf.put_u8(MessageType::GlobalRequest as u8);
        buf.put_string(self.name.as_bytes());
        buf.put_bool(self.want_reply);
        buf.put_slice(&self.data);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = reader_for(data, MessageType::GlobalRequest)?;
        Ok(Self {
            name: r.utf8()?,
            want_reply: r.bool()?,
            data: r.rest().to_vec(),
        })
    }
}

/// `tcpip-forward` / `cancel-tcpip-forward` request data.
pub fn forward_request_data(address: &str, port: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + address.len());
    buf.put_string(address.as_bytes());
    buf.put_u32(port);
    buf
}

/// `forwarded-tcpip` channel open data (RFC 4254 Section 7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTcpip {
    /// Address that was connected.
    pub connected_address: String,
    /// Port that was connected.
    pub connected_port: u32,
    /// Originator address.
    pub originator_address: String,
    /// Originator port.
    pub originator_port: u32,
}

impl ForwardedTcpip {
    /// Parses the `extra` part of a CHANNEL_OPEN.
    pub fn from_extra(extra: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(extra);
        Ok(Self {
            connected_address: r.utf8()?,
            connected_port: r.u32()?,
            originator_address: r.utf8()?,
            originator_port: r.u32()?,
        })
    }
}
