//! Error types for Fynx
//!
//! A single enum covers every failure the protocol crates report. The variants
//! are grouped so that callers can tell apart a session that never came up, a
//! session that came up and was later torn down, and a failure that only
//! affects one channel of an otherwise healthy session.

use std::fmt;

/// Unified error type for all Fynx operations
#[derive(Debug)]
pub enum FynxError {
    /// I/O error on the underlying transport
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed or out-of-state protocol data
    Protocol(String),

    /// Integrity check failed on an inbound packet
    MacMismatch {
        /// Inbound sequence number of the rejected packet
        sequence: u32,
    },

    /// Algorithm negotiation failed
    Negotiation(String),

    /// The peer's host key was rejected by the trust policy
    HostKeyRejected(String),

    /// Security error (signatures, key material)
    Security(String),

    /// Every authentication method was tried without success
    AuthFailed,

    /// The last authentication attempt was cancelled by the user
    AuthCancelled,

    /// The operation requires a session that has completed `connect()`
    NotConnected,

    /// The session was connected and has since been closed
    Disconnected {
        /// SSH disconnect reason code
        reason: u32,
        /// Human-readable description
        description: String,
    },

    /// Channel-local failure; the session itself is unaffected
    Channel(String),

    /// A bounded wait elapsed
    Timeout(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FynxError {
    /// Returns true when the error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FynxError::Channel(_) | FynxError::Config(_) | FynxError::NotImplemented(_)
        )
    }

    /// Returns true for failures scoped to a single channel.
    pub fn is_channel_local(&self) -> bool {
        matches!(self, FynxError::Channel(_))
    }

    /// Returns true when the session never reached the connected state.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, FynxError::NotConnected)
    }
}

impl fmt::Display for FynxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FynxError::Io(e) => write!(f, "IO error: {}", e),
            FynxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FynxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FynxError::MacMismatch { sequence } => {
                write!(f, "MAC verification failed for packet {}", sequence)
            }
            FynxError::Negotiation(msg) => write!(f, "Algorithm negotiation failed: {}", msg),
            FynxError::HostKeyRejected(msg) => write!(f, "Host key rejected: {}", msg),
            FynxError::Security(msg) => write!(f, "Security error: {}", msg),
            FynxError::AuthFailed => write!(f, "Auth fail"),
            FynxError::AuthCancelled => write!(f, "Auth cancel"),
            FynxError::NotConnected => write!(f, "Session is not connected"),
            FynxError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected (reason {}): {}", reason, description),
            FynxError::Channel(msg) => write!(f, "Channel error: {}", msg),
            FynxError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            FynxError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            FynxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FynxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FynxError::Io(e) => Some(e),
            FynxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FynxError {
    fn from(err: std::io::Error) -> Self {
        FynxError::Io(err)
    }
}

/// Result type for Fynx operations
pub type FynxResult<T> = Result<T, FynxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FynxError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
        assert_eq!(FynxError::AuthFailed.to_string(), "Auth fail");
        assert_eq!(
            FynxError::MacMismatch { sequence: 7 }.to_string(),
            "MAC verification failed for packet 7"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fynx_err: FynxError = io_err.into();
        assert!(matches!(fynx_err, FynxError::Io(_)));
        assert!(fynx_err.is_fatal());
    }

    #[test]
    fn test_taxonomy_predicates() {
        let channel = FynxError::Channel("channel is broken".to_string());
        assert!(channel.is_channel_local());
        assert!(!channel.is_fatal());

        let gone = FynxError::Disconnected {
            reason: 11,
            description: "bye".to_string(),
        };
        assert!(gone.is_fatal());
        assert!(!gone.is_not_connected());
        assert!(FynxError::NotConnected.is_not_connected());
    }
}
