//! Binary packet protocol (RFC 4253 Section 6).
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload; n1 = packet_length - padding_length - 1
//! byte[n2]  random padding; n2 = padding_length
//! byte[m]   mac; m = mac_length
//! ```
//!
//! [`PacketWriter`] and [`PacketReader`] each own one direction of the
//! connection together with that direction's cipher, MAC, compressor and
//! sequence number. The two halves are independent so the reader can live in
//! the dispatch task while the writer sits behind the session's write lock.
//!
//! # Security
//!
//! - The declared length is checked against [`MAX_PACKET_LENGTH`] before any
//!   further bytes are read.
//! - MAC tags are compared in constant time.
//! - Any framing or MAC failure is returned as an error; callers treat it as
//!   fatal.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::packet::{PacketReader, PacketWriter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> fynx_platform::FynxResult<()> {
//! let (a, b) = tokio::io::duplex(4096);
//! let mut writer = PacketWriter::new(a);
//! let mut reader = PacketReader::new(b);
//!
//! writer.write_packet(&[2, 0, 0, 0, 0]).await?;
//! assert_eq!(reader.read_packet().await?, vec![2, 0, 0, 0, 0]);
//! assert_eq!(writer.sequence(), 1);
//! assert_eq!(reader.sequence(), 1);
//! # Ok(())
//! # }
//! ```

use crate::algorithm::cipher::NoneCipher;
use crate::algorithm::{Cipher, Compressor, Mac};
use bytes::{Buf, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest `packet_length` accepted from the peer.
pub const MAX_PACKET_LENGTH: usize = 32768 - 4;

/// Smallest `packet_length` accepted from the peer.
pub const MIN_PACKET_LENGTH: usize = 5;

/// Minimum padding length (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Block size used for padding when no cipher is active.
pub const MIN_BLOCK_SIZE: usize = 8;

const READ_CHUNK: usize = 8192;

fn effective_block_size(cipher: &dyn Cipher) -> usize {
    cipher.block_size().max(MIN_BLOCK_SIZE)
}

/// Outbound half of the connection.
pub struct PacketWriter<W> {
    inner: W,
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    compressor: Option<Box<dyn Compressor>>,
    sequence: u32,
    bytes_since_rekey: u64,
}

impl<W> PacketWriter<W> {
    /// Wraps a byte sink; no cipher, MAC or compression yet.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            cipher: Box::new(NoneCipher),
            mac: None,
            compressor: None,
            sequence: 0,
            bytes_since_rekey: 0,
        }
    }

    /// Replaces cipher and MAC together.
    pub fn set_keys(&mut self, cipher: Box<dyn Cipher>, mac: Option<Box<dyn Mac>>) {
        self.cipher = cipher;
        self.mac = mac;
        self.bytes_since_rekey = 0;
    }

    /// Starts (or stops) compressing payloads.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Drops all key material and returns to the unkeyed state.
    pub fn clear_keys(&mut self) {
        self.set_keys(Box::new(NoneCipher), None);
        self.compressor = None;
    }

    /// Next outbound sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Wire bytes written since the keys were last replaced.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    /// Name of the active cipher.
    pub fn cipher_name(&self) -> &str {
        self.cipher.name()
    }

    /// Mutable access to the raw sink (identification line only).
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Frames, MACs and encrypts one payload without sending it.
    ///
    /// Does not advance the sequence number; [`write_packet`](Self::write_packet)
    /// does that once the bytes are on the wire.
    pub fn seal(&mut self, payload: &[u8]) -> FynxResult<Vec<u8>> {
        let compressed;
        let payload = match self.compressor.as_mut() {
            Some(c) => {
                compressed = c.compress(payload)?;
                &compressed[..]
            }
            None => payload,
        };

        let block = effective_block_size(self.cipher.as_ref());
        let mut padding = block - (4 + 1 + payload.len()) % block;
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
        let packet_length = 1 + payload.len() + padding;

        let mac_len = self.mac.as_ref().map_or(0, |m| m.output_size());
        let mut wire = Vec::with_capacity(4 + packet_length + mac_len);
        wire.extend_from_slice(&(packet_length as u32).to_be_bytes());
        wire.push(padding as u8);
        wire.extend_from_slice(payload);
        let pad_start = wire.len();
        wire.resize(pad_start + padding, 0);
        rand::thread_rng().fill_bytes(&mut wire[pad_start..]);

        let tag = match self.mac.as_ref() {
            Some(mac) => Some(mac.compute(self.sequence, &wire)?),
            None => None,
        };
        self.cipher.update(&mut wire)?;
        if let Some(tag) = tag {
            wire.extend_from_slice(&tag);
        }
        Ok(wire)
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Sends one payload and advances the sequence number.
    pub async fn write_packet(&mut self, payload: &[u8]) -> FynxResult<()> {
        let wire = self.seal(payload)?;
        self.inner.write_all(&wire).await?;
        self.inner.flush().await?;
        trace!(
            seq = self.sequence,
            msg = payload.first().copied().unwrap_or(0),
            len = wire.len(),
            "Packet sent"
        );
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_rekey += wire.len() as u64;
        Ok(())
    }

    /// Closes the sink.
    pub async fn shutdown(&mut self) -> FynxResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

struct Pending {
    packet_length: usize,
    head: Vec<u8>,
}

/// Inbound half of the connection.
///
/// Reading is cancel safe: bytes already received stay buffered, so a read
/// abandoned by a timeout resumes where it left off.
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    compressor: Option<Box<dyn Compressor>>,
    sequence: u32,
    pending: Option<Pending>,
    bytes_since_rekey: u64,
}

impl<R> PacketReader<R> {
    /// Wraps a byte source; no cipher, MAC or compression yet.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            cipher: Box::new(NoneCipher),
            mac: None,
            compressor: None,
            sequence: 0,
            pending: None,
            bytes_since_rekey: 0,
        }
    }

    /// Replaces cipher and MAC together.
    pub fn set_keys(&mut self, cipher: Box<dyn Cipher>, mac: Option<Box<dyn Mac>>) {
        self.cipher = cipher;
        self.mac = mac;
        self.bytes_since_rekey = 0;
    }

    /// Starts (or stops) decompressing payloads.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Drops all key material and returns to the unkeyed state.
    pub fn clear_keys(&mut self) {
        self.set_keys(Box::new(NoneCipher), None);
        self.compressor = None;
    }

    /// Next inbound sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Wire bytes decoded since the keys were last replaced.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends raw bytes as if they had been read from the source.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decodes one packet from buffered bytes, `Ok(None)` if more are needed.
    pub fn decode_buffered(&mut self) -> FynxResult<Option<Vec<u8>>> {
        let block = effective_block_size(self.cipher.as_ref());

        if self.pending.is_none() {
            if self.buf.len() < block {
                return Ok(None);
            }
            let mut head = self.buf.split_to(block).to_vec();
            self.cipher.update(&mut head)?;
            let packet_length =
                u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&packet_length) {
                return Err(FynxError::Protocol(format!(
                    "Invalid packet length: {}",
                    packet_length
                )));
            }
            if (packet_length + 4) % block != 0 {
                return Err(FynxError::Protocol(format!(
                    "Packet length {} is not a multiple of block size {}",
                    packet_length, block
                )));
            }
            self.pending = Some(Pending {
                packet_length,
                head,
            });
        }

        let Some(pending) = self.pending.as_ref() else {
            return Ok(None);
        };
        let mac_len = self.mac.as_ref().map_or(0, |m| m.output_size());
        let body_len = pending.packet_length + 4 - block;
        if self.buf.len() < body_len + mac_len {
            return Ok(None);
        }
        let Some(Pending {
            packet_length,
            head: mut packet,
        }) = self.pending.take()
        else {
            return Ok(None);
        };

        let mut body = self.buf.split_to(body_len).to_vec();
        self.cipher.update(&mut body)?;
        packet.extend_from_slice(&body);

        if let Some(mac) = self.mac.as_ref() {
            let expected = mac.compute(self.sequence, &packet)?;
            let received = &self.buf[..mac_len];
            let ok: bool = expected.ct_eq(received).into();
            self.buf.advance(mac_len);
            if !ok {
                return Err(FynxError::MacMismatch {
                    sequence: self.sequence,
                });
            }
        }

        let padding = packet[4] as usize;
        if padding < MIN_PADDING_LEN || padding + 1 > packet_length {
            return Err(FynxError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding, packet_length
            )));
        }
        let payload = &packet[5..4 + packet_length - padding];

        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_rekey += (4 + packet_length + mac_len) as u64;

        let payload = match self.compressor.as_mut() {
            Some(c) => c.decompress(payload)?,
            None => payload.to_vec(),
        };
        trace!(
            seq,
            msg = payload.first().copied().unwrap_or(0),
            len = payload.len(),
            "Packet received"
        );
        Ok(Some(payload))
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    async fn fill(&mut self) -> FynxResult<()> {
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FynxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        Ok(())
    }

    /// Reads, decrypts and verifies the next packet, returning its payload.
    pub async fn read_packet(&mut self) -> FynxResult<Vec<u8>> {
        loop {
            if let Some(payload) = self.decode_buffered()? {
                return Ok(payload);
            }
            self.fill().await?;
        }
    }

    /// Reads one LF-terminated line, used before the first packet.
    pub async fn read_line(&mut self, max: usize) -> FynxResult<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > max {
                return Err(FynxError::Protocol(format!(
                    "Identification line longer than {} bytes",
                    max
                )));
            }
            self.fill().await?;
        }
    }
}
