//! Protocol version exchange (RFC 4253 Section 4.2).
//!
//! Each side sends `SSH-protoversion-softwareversion SP comments CR LF`.
//! Servers may send other lines first; those are logged and skipped. A server
//! speaking only protocol 1 is refused, `1.99` (compatible with 2.0) is not.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::version::Version;
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3\r\n").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9p1");
//! assert_eq!(parsed.comments(), Some("Ubuntu-3"));
//! assert_eq!(parsed.as_str(), "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3");
//! ```

use crate::packet::PacketReader;
use fynx_platform::{FynxError, FynxResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Longest identification line accepted, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Lines tolerated before the identification line.
pub const MAX_PREAMBLE_LINES: usize = 64;

/// A parsed identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Parses one identification line, with or without the line terminator.
    pub fn parse(line: &str) -> FynxResult<Self> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(FynxError::Protocol(format!(
                "Version string too long: {} bytes",
                line.len()
            )));
        }
        if line.contains('\0') {
            return Err(FynxError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }
        // "SSH-x.y" is the shortest form worth looking at.
        if line.len() < 7 || !line.starts_with("SSH-") {
            return Err(FynxError::Protocol(format!(
                "invalid server's version string: '{}'",
                line
            )));
        }

        let mut parts = line.splitn(3, '-');
        let (_, proto, rest) = (parts.next(), parts.next(), parts.next());
        let (Some(proto), Some(rest)) = (proto, rest) else {
            return Err(FynxError::Protocol(format!(
                "invalid server's version string: '{}'",
                line
            )));
        };

        if proto.starts_with('1') && proto != "1.99" {
            return Err(FynxError::Protocol(format!(
                "invalid server's version string: protocol {} is not supported",
                proto
            )));
        }
        if proto != "2.0" && proto != "1.99" {
            return Err(FynxError::Protocol(format!(
                "Unsupported protocol version: '{}'",
                proto
            )));
        }

        let (software, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };

        Ok(Self {
            raw: line.to_string(),
            proto_version: proto.to_string(),
            software_version: software.to_string(),
            comments,
        })
    }

    /// The identification line without CR LF, as hashed into the exchange hash.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `2.0` or `1.99`.
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version field.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Trailing comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Sends our identification line.
pub async fn send_identification<W>(writer: &mut W, ident: &str) -> FynxResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ident.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines until the peer's identification line, skipping any banner.
pub async fn read_identification<R>(reader: &mut PacketReader<R>) -> FynxResult<Version>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..=MAX_PREAMBLE_LINES {
        let line = reader.read_line(MAX_VERSION_LENGTH + 2).await?;
        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            debug!(server_version = %version, "Received identification");
            return Ok(version);
        }
        debug!(line = %line.trim_end(), "Skipping pre-identification line");
    }
    Err(FynxError::Protocol(
        "No identification line from peer".to_string(),
    ))
}
