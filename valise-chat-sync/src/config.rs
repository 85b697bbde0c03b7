//! Synchronization configuration

use std::time::Duration;

/// Default incremental poll interval
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default capacity of the change-notification channel
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Synchronization configuration
///
/// The poll interval bounds how stale an open conversation can get when push
/// delivery is delayed, missed, or never established.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed interval between incremental polls of the open conversation
    pub poll_interval: Duration,

    /// Buffered capacity of the change-notification broadcast channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.event_capacity, 64);
    }
}
