//! Host key trust: the repository interface, the interactive prompt interface
//! and the `StrictHostKeyChecking` policy that combines them.
//!
//! Only an in-memory repository ships with the crate. Applications that
//! persist keys implement [`HostKeyRepository`] over their own storage.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::known_hosts::{HostKeyRepository, HostKeyStatus, MemoryHostKeyRepository};
//!
//! let repo = MemoryHostKeyRepository::new();
//! repo.add("example.com", "ssh-ed25519", b"key-a");
//! assert_eq!(repo.check("example.com", b"key-a"), HostKeyStatus::Known);
//! assert_eq!(repo.check("example.com", b"key-b"), HostKeyStatus::Changed);
//! assert_eq!(repo.check("[example.com]:2222", b"key-a"), HostKeyStatus::Unknown);
//! ```

use crate::hostkey;
use fynx_platform::{FynxError, FynxResult};
use std::sync::RwLock;
use tracing::{info, warn};

/// Result of looking a host up in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The presented key is on record for this host.
    Known,
    /// The host is on record with a different key.
    Changed,
    /// Nothing on record for this host.
    Unknown,
}

/// Host key checking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Only hosts already on record are accepted.
    Strict,
    /// Unknown hosts are confirmed through [`UserInfo::prompt_yes_no`].
    #[default]
    Ask,
    /// Unknown hosts are recorded silently; changed keys are refused.
    AcceptNew,
    /// Everything is accepted; changed keys replace the old record.
    No,
}

/// Storage of trusted host keys.
pub trait HostKeyRepository: Send + Sync {
    /// Looks up `host` (already in alias form) with the presented key blob.
    fn check(&self, host: &str, key: &[u8]) -> HostKeyStatus;

    /// Records a key for `host`.
    fn add(&self, host: &str, key_type: &str, key: &[u8]);

    /// Forgets keys for `host`, all types when `key_type` is `None`.
    fn remove(&self, host: &str, key_type: Option<&str>);
}

/// Interactive prompts offered to the engine.
pub trait UserInfo: Send + Sync {
    /// Asks a yes/no question.
    fn prompt_yes_no(&self, message: &str) -> bool;

    /// Displays a message (warnings, authentication banners).
    fn show_message(&self, message: &str);

    /// Asks for a password. `None` cancels.
    fn prompt_password(&self, _message: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
struct Entry {
    host: String,
    key_type: String,
    key: Vec<u8>,
}

/// Repository kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryHostKeyRepository {
    entries: RwLock<Vec<Entry>>,
}

impl MemoryHostKeyRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded keys.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostKeyRepository for MemoryHostKeyRepository {
    fn check(&self, host: &str, key: &[u8]) -> HostKeyStatus {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = false;
        for entry in entries.iter().filter(|e| e.host == host) {
            if entry.key == key {
                return HostKeyStatus::Known;
            }
            seen = true;
        }
        if seen {
            HostKeyStatus::Changed
        } else {
            HostKeyStatus::Unknown
        }
    }

    fn add(&self, host: &str, key_type: &str, key: &[u8]) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| e.host == host && e.key == key) {
            return;
        }
        entries.push(Entry {
            host: host.to_string(),
            key_type: key_type.to_string(),
            key: key.to_vec(),
        });
    }

    fn remove(&self, host: &str, key_type: Option<&str>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|e| !(e.host == host && key_type.map_or(true, |t| t == e.key_type)));
    }
}

/// Name a host is recorded under: `host` on port 22, `[host]:port` otherwise.
pub fn host_alias(host: &str, port: u16, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => alias.to_string(),
        None if port == 22 => host.to_string(),
        None => format!("[{}]:{}", host, port),
    }
}

/// Applies the checking policy to a presented host key.
///
/// Called exactly once per key exchange, before any derived key is used.
pub fn verify_host_key(
    repository: &dyn HostKeyRepository,
    user_info: Option<&dyn UserInfo>,
    policy: StrictHostKeyChecking,
    host: &str,
    key: &[u8],
) -> FynxResult<()> {
    let key_type = hostkey::key_type(key)?;
    let fp = hostkey::fingerprint(key);
    let status = repository.check(host, key);

    match (status, policy) {
        (HostKeyStatus::Known, _) => {
            info!(host = %host, key_type = %key_type, "Host key matches known key");
            Ok(())
        }
        (HostKeyStatus::Changed, StrictHostKeyChecking::No) => {
            warn!(host = %host, fingerprint = %fp, "Host key changed, replacing");
            repository.remove(host, Some(&key_type));
            repository.add(host, &key_type, key);
            Ok(())
        }
        (HostKeyStatus::Changed, _) => {
            if let Some(ui) = user_info {
                ui.show_message(&format!(
                    "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!\n\
                     Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
                     It is also possible that the {} host key has just been changed.\n\
                     The fingerprint for the {} key sent by the remote host {} is\n{}.",
                    key_type, key_type, host, fp
                ));
            }
            Err(FynxError::HostKeyRejected(format!(
                "HostKey has been changed: {}",
                host
            )))
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::Strict) => Err(
            FynxError::HostKeyRejected(format!("reject HostKey: {}", host)),
        ),
        (HostKeyStatus::Unknown, StrictHostKeyChecking::Ask) => {
            let Some(ui) = user_info else {
                return Err(FynxError::HostKeyRejected(format!(
                    "UnknownHostKey: {}. {} key fingerprint is {}",
                    host, key_type, fp
                )));
            };
            let accepted = ui.prompt_yes_no(&format!(
                "The authenticity of host '{}' can't be established.\n\
                 {} key fingerprint is {}.\n\
                 Are you sure you want to continue connecting?",
                host, key_type, fp
            ));
            if !accepted {
                return Err(FynxError::HostKeyRejected(format!(
                    "reject HostKey: {}",
                    host
                )));
            }
            repository.add(host, &key_type, key);
            warn!(host = %host, key_type = %key_type, "Permanently added host key");
            Ok(())
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::AcceptNew) => {
            repository.add(host, &key_type, key);
            warn!(host = %host, key_type = %key_type, "Permanently added host key");
            Ok(())
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::No) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SshBufMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(tag: u8) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.put_string(b"ssh-ed25519");
        blob.put_string(&[tag; 32]);
        blob
    }

    struct Prompt {
        answer: bool,
        asked: AtomicUsize,
        shown: AtomicUsize,
    }

    impl Prompt {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                asked: AtomicUsize::new(0),
                shown: AtomicUsize::new(0),
            }
        }
    }

    impl UserInfo for Prompt {
        fn prompt_yes_no(&self, _message: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }

        fn show_message(&self, _message: &str) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_alias() {
        assert_eq!(host_alias("example.com", 22, None), "example.com");
        assert_eq!(host_alias("example.com", 2222, None), "[example.com]:2222");
        assert_eq!(host_alias("example.com", 2222, Some("box")), "box");
    }

    #[test]
    fn test_strict_rejects_unknown() {
        let repo = MemoryHostKeyRepository::new();
        let err = verify_host_key(&repo, None, StrictHostKeyChecking::Strict, "h", &key(1))
            .unwrap_err();
        assert!(matches!(err, FynxError::HostKeyRejected(_)));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_ask_accepted_is_recorded() {
        let repo = MemoryHostKeyRepository::new();
        let prompt = Prompt::new(true);
        verify_host_key(&repo, Some(&prompt), StrictHostKeyChecking::Ask, "h", &key(1)).unwrap();
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        assert_eq!(repo.check("h", &key(1)), HostKeyStatus::Known);
    }

    #[test]
    fn test_ask_declined_or_without_prompt() {
        let repo = MemoryHostKeyRepository::new();
        let prompt = Prompt::new(false);
        assert!(
            verify_host_key(&repo, Some(&prompt), StrictHostKeyChecking::Ask, "h", &key(1))
                .is_err()
        );
        assert!(verify_host_key(&repo, None, StrictHostKeyChecking::Ask, "h", &key(1)).is_err());
        assert!(repo.is_empty());
    }

    #[test]
    fn test_changed_key_warns_and_rejects() {
        let repo = MemoryHostKeyRepository::new();
        repo.add("h", "ssh-ed25519", &key(1));
        let prompt = Prompt::new(true);
        let err = verify_host_key(
            &repo,
            Some(&prompt),
            StrictHostKeyChecking::AcceptNew,
            "h",
            &key(2),
        )
        .unwrap_err();
        assert!(err.to_string().contains("HostKey has been changed"));
        assert_eq!(prompt.shown.load(Ordering::SeqCst), 1);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_policy_replaces_changed_key() {
        let repo = MemoryHostKeyRepository::new();
        repo.add("h", "ssh-ed25519", &key(1));
        verify_host_key(&repo, None, StrictHostKeyChecking::No, "h", &key(2)).unwrap();
        assert_eq!(repo.check("h", &key(2)), HostKeyStatus::Known);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_remove_by_type() {
        let repo = MemoryHostKeyRepository::new();
        repo.add("h", "ssh-ed25519", &key(1));
        repo.add("h", "ssh-rsa", b"rsa");
        repo.remove("h", Some("ssh-rsa"));
        assert_eq!(repo.len(), 1);
        repo.remove("h", None);
        assert!(repo.is_empty());
    }
}
