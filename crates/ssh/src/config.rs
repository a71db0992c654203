//! Session configuration.
//!
//! [`SessionConfig`] holds the algorithm proposals, trust policy, timeouts and
//! limits of one session. Collaborators (host key store, prompts, socket
//! factory, extra algorithms) are set on [`crate::SessionBuilder`] instead.

use crate::algorithm::AlgorithmRegistry;
use crate::auth::DEFAULT_PREFERRED_AUTHENTICATIONS;
use crate::channel::{DEFAULT_LOCAL_MAX_PACKET, DEFAULT_LOCAL_WINDOW, MAX_LOCAL_MAX_PACKET};
use crate::kex::Category;
use crate::known_hosts::StrictHostKeyChecking;
use fynx_platform::{FynxError, FynxResult};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Default key exchange proposal.
pub const DEFAULT_KEX: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
];

/// Default host key algorithm proposal.
pub const DEFAULT_HOST_KEY: &[&str] = &["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"];

/// Default cipher proposal, both directions.
pub const DEFAULT_CIPHERS: &[&str] = &[
    "aes128-ctr",
    "aes192-ctr",
    "aes256-ctr",
    "aes128-cbc",
    "aes256-cbc",
];

/// Default MAC proposal, both directions.
pub const DEFAULT_MACS: &[&str] = &["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1", "hmac-sha1-96"];

/// Default compression proposal, both directions.
pub const DEFAULT_COMPRESSION: &[&str] = &["none"];

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Parses a comma separated name-list, dropping empty entries.
pub fn parse_name_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration of one SSH session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Key exchange methods, most preferred first
    pub kex: Vec<String>,
    /// Host key algorithms
    pub server_host_key: Vec<String>,
    /// Ciphers client to server
    pub cipher_c2s: Vec<String>,
    /// Ciphers server to client
    pub cipher_s2c: Vec<String>,
    /// MACs client to server
    pub mac_c2s: Vec<String>,
    /// MACs server to client
    pub mac_s2c: Vec<String>,
    /// Compression client to server
    pub compression_c2s: Vec<String>,
    /// Compression server to client
    pub compression_s2c: Vec<String>,
    /// Languages client to server
    pub lang_c2s: Vec<String>,
    /// Languages server to client
    pub lang_s2c: Vec<String>,

    /// Drop proposal entries that cannot be instantiated before sending KEXINIT
    pub check_ciphers: bool,

    /// Authentication methods, most preferred first
    pub preferred_authentications: Vec<String>,

    /// Host key checking policy
    pub strict_host_key_checking: StrictHostKeyChecking,

    /// Name to look the host key up under, instead of host/port
    pub host_key_alias: Option<String>,

    /// Our identification string, without CR LF
    pub client_version: String,

    /// Connect timeout and per-read timeout; `None` waits forever
    pub timeout: Option<Duration>,

    /// Read timeout that triggers keep-alive probes; overrides `timeout`
    pub server_alive_interval: Option<Duration>,

    /// Unanswered probes tolerated before the connection is declared dead
    pub server_alive_count_max: u32,

    /// Accept `x11` channel opens from the peer
    pub x11_forwarding: bool,

    /// Accept `auth-agent@openssh.com` channel opens from the peer
    pub agent_forwarding: bool,

    /// Receive window restored by WINDOW_ADJUST
    pub local_window_max: u32,

    /// Largest data packet we accept
    pub local_max_packet: u32,

    /// Rekey after this many bytes in either direction
    pub rekey_bytes_limit: u64,

    /// Rekey after this much time
    pub rekey_time_limit: Option<Duration>,

    /// Bound on waiting for a global request reply
    pub global_request_timeout: Duration,

    /// Bound on waiting for a channel open confirmation
    pub channel_open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kex: names(DEFAULT_KEX),
            server_host_key: names(DEFAULT_HOST_KEY),
            cipher_c2s: names(DEFAULT_CIPHERS),
            cipher_s2c: names(DEFAULT_CIPHERS),
            mac_c2s: names(DEFAULT_MACS),
            mac_s2c: names(DEFAULT_MACS),
            compression_c2s: names(DEFAULT_COMPRESSION),
            compression_s2c: names(DEFAULT_COMPRESSION),
            lang_c2s: Vec::new(),
            lang_s2c: Vec::new(),
            check_ciphers: true,
            preferred_authentications: parse_name_list(DEFAULT_PREFERRED_AUTHENTICATIONS),
            strict_host_key_checking: StrictHostKeyChecking::Ask,
            host_key_alias: None,
            client_version: format!("SSH-2.0-Fynx_{}", crate::VERSION),
            timeout: None,
            server_alive_interval: None,
            server_alive_count_max: 1,
            x11_forwarding: false,
            agent_forwarding: false,
            local_window_max: DEFAULT_LOCAL_WINDOW,
            local_max_packet: DEFAULT_LOCAL_MAX_PACKET,
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Some(Duration::from_secs(3600)),
            global_request_timeout: Duration::from_secs(10),
            channel_open_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key exchange proposal.
    pub fn with_kex(mut self, list: &str) -> Self {
        self.kex = parse_name_list(list);
        self
    }

    /// Sets the host key algorithm proposal.
    pub fn with_server_host_key(mut self, list: &str) -> Self {
        self.server_host_key = parse_name_list(list);
        self
    }

    /// Sets the cipher proposal for both directions.
    pub fn with_ciphers(mut self, list: &str) -> Self {
        self.cipher_c2s = parse_name_list(list);
        self.cipher_s2c = self.cipher_c2s.clone();
        self
    }

    /// Sets the MAC proposal for both directions.
    pub fn with_macs(mut self, list: &str) -> Self {
        self.mac_c2s = parse_name_list(list);
        self.mac_s2c = self.mac_c2s.clone();
        self
    }

    /// Sets the compression proposal for both directions.
    pub fn with_compression(mut self, list: &str) -> Self {
        self.compression_c2s = parse_name_list(list);
        self.compression_s2c = self.compression_c2s.clone();
        self
    }

    /// Sets the authentication preference order.
    pub fn with_preferred_authentications(mut self, list: &str) -> Self {
        self.preferred_authentications = parse_name_list(list);
        self
    }

    /// Sets the host key checking policy.
    pub fn with_strict_host_key_checking(mut self, policy: StrictHostKeyChecking) -> Self {
        self.strict_host_key_checking = policy;
        self
    }

    /// Looks host keys up under `alias`.
    pub fn with_host_key_alias(mut self, alias: impl Into<String>) -> Self {
        self.host_key_alias = Some(alias.into());
        self
    }

    /// Sets our identification string.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Sets the connect and read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Probes the server after `interval` of silence, `count_max` times.
    pub fn with_server_alive(mut self, interval: Duration, count_max: u32) -> Self {
        self.server_alive_interval = Some(interval);
        self.server_alive_count_max = count_max;
        self
    }

    /// Accepts `x11` channel opens.
    pub fn with_x11_forwarding(mut self, enabled: bool) -> Self {
        self.x11_forwarding = enabled;
        self
    }

    /// Accepts agent channel opens.
    pub fn with_agent_forwarding(mut self, enabled: bool) -> Self {
        self.agent_forwarding = enabled;
        self
    }

    /// Sets the receive window and the largest packet we accept.
    pub fn with_local_window(mut self, window: u32, max_packet: u32) -> Self {
        self.local_window_max = window;
        self.local_max_packet = max_packet;
        self
    }

    /// Sets the rekey thresholds.
    pub fn with_rekey_limits(mut self, bytes: u64, time: Option<Duration>) -> Self {
        self.rekey_bytes_limit = bytes;
        self.rekey_time_limit = time;
        self
    }

    /// Timeout that drives keep-alive probes, if any.
    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.server_alive_interval.or(self.timeout)
    }

    /// Validates configuration
    pub fn validate(&self) -> FynxResult<()> {
        if !self.client_version.starts_with("SSH-2.0-") {
            return Err(FynxError::Config(format!(
                "client_version must start with SSH-2.0-: {}",
                self.client_version
            )));
        }
        if self.client_version.len() > 253
            || self.client_version.contains(['\r', '\n'])
        {
            return Err(FynxError::Config(
                "client_version must be a single line of at most 253 bytes".to_string(),
            ));
        }
        let required = [
            ("kex", &self.kex),
            ("server_host_key", &self.server_host_key),
            ("cipher.c2s", &self.cipher_c2s),
            ("cipher.s2c", &self.cipher_s2c),
            ("mac.c2s", &self.mac_c2s),
            ("mac.s2c", &self.mac_s2c),
            ("compression.c2s", &self.compression_c2s),
            ("compression.s2c", &self.compression_s2c),
        ];
        for (name, list) in required {
            if list.is_empty() {
                return Err(FynxError::Config(format!("{} proposal is empty", name)));
            }
        }
        if self.local_window_max == 0 || self.local_max_packet == 0 {
            return Err(FynxError::Config(
                "local window and max packet must be non-zero".to_string(),
            ));
        }
        if self.local_max_packet > MAX_LOCAL_MAX_PACKET {
            return Err(FynxError::Config(format!(
                "local_max_packet {} exceeds {}",
                self.local_max_packet, MAX_LOCAL_MAX_PACKET
            )));
        }
        if self.rekey_bytes_limit == 0 {
            return Err(FynxError::Config("rekey_bytes_limit must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Builds the ten KEXINIT name-lists.
    ///
    /// With `check_ciphers` set, entries the registry cannot instantiate are
    /// dropped first; a list left empty is a configuration error.
    pub fn proposal(&self, registry: &AlgorithmRegistry) -> FynxResult<[Vec<String>; 10]> {
        let lists = [
            self.kex.clone(),
            self.server_host_key.clone(),
            self.cipher_c2s.clone(),
            self.cipher_s2c.clone(),
            self.mac_c2s.clone(),
            self.mac_s2c.clone(),
            self.compression_c2s.clone(),
            self.compression_s2c.clone(),
            self.lang_c2s.clone(),
            self.lang_s2c.clone(),
        ];
        if !self.check_ciphers {
            return Ok(lists);
        }

        let mut out = lists;
        for category in Category::ALL {
            let list = &mut out[category.index()];
            let before = list.len();
            list.retain(|name| match category {
                Category::Kex => registry.has_kex(name),
                Category::HostKey => registry.has_signature(name),
                Category::CipherC2s | Category::CipherS2c => registry.cipher_works(name),
                Category::MacC2s | Category::MacS2c => name == "none" || registry.has_mac(name),
                Category::CompressionC2s | Category::CompressionS2c => {
                    registry.has_compression(name)
                }
                Category::LangC2s | Category::LangS2c => true,
            });
            if list.len() != before {
                debug!(category = category.name(), kept = %list.join(","), "Dropped unavailable algorithms");
            }
            let is_language = matches!(category, Category::LangC2s | Category::LangS2c);
            if list.is_empty() && !is_language {
                return Err(FynxError::Config(format!(
                    "No usable algorithm left in {} proposal",
                    category.name()
                )));
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("kex", &self.kex.join(","))
            .field("server_host_key", &self.server_host_key.join(","))
            .field("cipher_c2s", &self.cipher_c2s.join(","))
            .field("mac_c2s", &self.mac_c2s.join(","))
            .field("compression_c2s", &self.compression_c2s.join(","))
            .field("preferred_authentications", &self.preferred_authentications.join(","))
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("client_version", &self.client_version)
            .field("timeout", &self.timeout)
            .field("server_alive_interval", &self.server_alive_interval)
            .field("server_alive_count_max", &self.server_alive_count_max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert!(config.client_version.starts_with("SSH-2.0-Fynx_"));
        assert_eq!(config.server_alive_count_max, 1);
        assert_eq!(
            config.preferred_authentications,
            ["gssapi-with-mic", "publickey", "keyboard-interactive", "password"]
        );
        assert_eq!(config.strict_host_key_checking, StrictHostKeyChecking::Ask);
    }

    #[test]
    fn test_validate_rejects_bad_version_and_empty_lists() {
        let config = SessionConfig::default().with_client_version("SSH-1.99-Old");
        assert!(matches!(config.validate(), Err(FynxError::Config(_))));

        let config = SessionConfig::default().with_ciphers("");
        assert!(matches!(config.validate(), Err(FynxError::Config(_))));
    }

    #[test]
    fn test_validate_bounds_local_max_packet() {
        let config = SessionConfig::default().with_local_window(DEFAULT_LOCAL_WINDOW, 65536);
        assert!(matches!(config.validate(), Err(FynxError::Config(_))));

        let config = SessionConfig::default()
            .with_local_window(DEFAULT_LOCAL_WINDOW, MAX_LOCAL_MAX_PACKET + 1);
        assert!(config.validate().is_err());

        let config =
            SessionConfig::default().with_local_window(DEFAULT_LOCAL_WINDOW, MAX_LOCAL_MAX_PACKET);
        config.validate().unwrap();
    }

    #[test]
    fn test_proposal_filters_unknown_names() {
        let registry = AlgorithmRegistry::with_defaults();
        let config = SessionConfig::default()
            .with_ciphers("chacha20-poly1305@openssh.com,aes128-ctr")
            .with_macs("hmac-md5,hmac-sha1");
        let lists = config.proposal(&registry).unwrap();
        assert_eq!(lists[Category::CipherC2s.index()], ["aes128-ctr"]);
        assert_eq!(lists[Category::MacS2c.index()], ["hmac-sha1"]);
        assert!(lists[Category::LangC2s.index()].is_empty());
    }

    #[test]
    fn test_proposal_unchecked_keeps_everything() {
        let registry = AlgorithmRegistry::with_defaults();
        let mut config = SessionConfig::default().with_ciphers("made-up-cipher");
        assert!(config.proposal(&registry).is_err());
        config.check_ciphers = false;
        let lists = config.proposal(&registry).unwrap();
        assert_eq!(lists[Category::CipherS2c.index()], ["made-up-cipher"]);
    }

    #[test]
    fn test_parse_name_list() {
        assert_eq!(parse_name_list("a, b,,c"), ["a", "b", "c"]);
        assert!(parse_name_list("").is_empty());
    }
}
