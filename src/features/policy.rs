//! Per-level user policies
//!
//! A policy bundles the tunables the dispatch chain consults for one user
//! level: timeout knobs, stat switches, and the per-connection buffer
//! limit that bounds the dispatch pipes.

use std::collections::HashMap;
use std::time::Duration;

use super::Feature;

/// Timeout knobs. The dispatch core only carries these; proxy protocol
/// implementations consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub handshake: Duration,
    pub connection_idle: Duration,
    pub uplink_only: Duration,
    pub downlink_only: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(1),
            downlink_only: Duration::from_secs(1),
        }
    }
}

/// Which per-user traffic counters to maintain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsPolicy {
    pub user_uplink: bool,
    pub user_downlink: bool,
}

/// Per-connection buffering. `None` means unbounded pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub per_connection: Option<usize>,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            per_connection: Some(512 * 1024),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub timeouts: TimeoutPolicy,
    pub stats: StatsPolicy,
    pub buffer: BufferPolicy,
}

/// Maps a user level to its policy.
pub trait PolicyManager: Feature {
    fn for_level(&self, level: u32) -> Policy;
}

/// Essential default: one permissive policy for every level, no counters.
#[derive(Debug, Default)]
pub struct DefaultPolicyManager;

impl Feature for DefaultPolicyManager {}

impl PolicyManager for DefaultPolicyManager {
    fn for_level(&self, _level: u32) -> Policy {
        Policy::default()
    }
}

/// Config-driven manager: explicit policies per level, falling back to a
/// configurable default for unknown levels.
pub struct LevelPolicyManager {
    levels: HashMap<u32, Policy>,
    fallback: Policy,
}

impl LevelPolicyManager {
    pub fn new(levels: HashMap<u32, Policy>, fallback: Policy) -> Self {
        Self { levels, fallback }
    }
}

impl Feature for LevelPolicyManager {}

impl PolicyManager for LevelPolicyManager {
    fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manager_has_no_counters() {
        let p = DefaultPolicyManager.for_level(7);
        assert!(!p.stats.user_uplink);
        assert!(!p.stats.user_downlink);
    }

    #[test]
    fn test_level_manager_falls_back() {
        let mut levels = HashMap::new();
        levels.insert(
            1,
            Policy {
                stats: StatsPolicy {
                    user_uplink: true,
                    user_downlink: true,
                },
                ..Default::default()
            },
        );
        let manager = LevelPolicyManager::new(levels, Policy::default());
        assert!(manager.for_level(1).stats.user_uplink);
        assert!(!manager.for_level(2).stats.user_uplink);
    }
}
