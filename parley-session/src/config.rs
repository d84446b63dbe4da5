//! Runtime settings for a session

use parley_common::config::SessionSettings;
use std::time::Duration;

use crate::merge::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub anonymous_quota: u32,
    /// How long a submission may wait for its transcription
    pub pending_timeout: Duration,
    pub merge_retry: RetryPolicy,
    /// Pause before another merge round after one exhausts its attempts
    pub merge_retry_interval: Duration,
    pub resubscribe_failure_threshold: u32,
    pub resubscribe_backoff: Duration,
    pub sweep_interval: Duration,
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            anonymous_quota: settings.anonymous_quota,
            pending_timeout: Duration::from_secs(settings.pending_timeout_secs),
            merge_retry: RetryPolicy {
                max_attempts: settings.merge_max_attempts.max(1),
                initial_backoff: Duration::from_millis(settings.merge_initial_backoff_ms),
                ..RetryPolicy::default()
            },
            merge_retry_interval: Duration::from_secs(30),
            resubscribe_failure_threshold: settings.resubscribe_failure_threshold.max(1),
            resubscribe_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
            command_buffer: 64,
        }
    }
}
