//! Keep-alive probing on read timeouts.
//!
//! When the dispatch loop's read times out it asks [`KeepaliveState`] what to
//! do. Outside a key exchange it sends a `keepalive@jcraft.com` global request
//! with `want_reply` set. Any reply (servers usually answer REQUEST_FAILURE)
//! is traffic, which resets the counter. Once `count_max` probes go
//! unanswered the connection is considered dead.

use crate::connection::GlobalRequest;

/// Global request name used for probes.
pub const KEEPALIVE_REQUEST: &str = "keepalive@jcraft.com";

/// What to do after a read timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    /// Send a probe and keep reading.
    Probe,
    /// Keep reading without probing (a key exchange is running).
    Wait,
    /// Give up on the connection.
    Dead,
}

/// Counts consecutive read timeouts.
#[derive(Debug, Clone)]
pub(crate) struct KeepaliveState {
    misses: u32,
    count_max: u32,
}

impl KeepaliveState {
    pub(crate) fn new(count_max: u32) -> Self {
        Self {
            misses: 0,
            count_max,
        }
    }

    /// Called whenever a packet arrives.
    pub(crate) fn reset(&mut self) {
        self.misses = 0;
    }

    /// Called on each read timeout.
    pub(crate) fn on_timeout(&mut self, in_kex: bool) -> KeepaliveAction {
        if self.misses >= self.count_max {
            return KeepaliveAction::Dead;
        }
        self.misses += 1;
        if in_kex {
            KeepaliveAction::Wait
        } else {
            KeepaliveAction::Probe
        }
    }

    pub(crate) fn misses(&self) -> u32 {
        self.misses
    }
}

/// The probe payload.
pub fn keepalive_message() -> Vec<u8> {
    GlobalRequest {
        name: KEEPALIVE_REQUEST.to_string(),
        want_reply: true,
        data: Vec::new(),
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probes_then_gives_up() {
        let mut state = KeepaliveState::new(2);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Probe);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Probe);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Dead);
        assert_eq!(state.misses(), 2);
    }

    #[test]
    fn test_reset_on_traffic() {
        let mut state = KeepaliveState::new(1);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Probe);
        state.reset();
        assert_eq!(state.on_timeout(true), KeepaliveAction::Wait);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Dead);
    }

    #[test]
    fn test_zero_count_max_is_dead_at_once() {
        let mut state = KeepaliveState::new(0);
        assert_eq!(state.on_timeout(false), KeepaliveAction::Dead);
    }

    #[test]
    fn test_message_format() {
        let msg = keepalive_message();
        let parsed = GlobalRequest::from_bytes(&msg).unwrap();
        assert_eq!(parsed.name, "keepalive@jcraft.com");
        assert!(parsed.want_reply);
        assert!(parsed.data.is_empty());
    }
}
