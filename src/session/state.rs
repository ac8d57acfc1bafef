//! Connection lifecycle state and retry policy.

use serde::Serialize;
use std::time::Duration;

/// Session connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering { attempt: u32 },
    Error,
}

/// What the pipeline is doing, derived from protocol events and playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

/// Retry policy: exponential backoff with a cap and bounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). None once the
    /// attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.cap);
        Some(delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let p = policy();
        assert_eq!(p.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(p.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(p.delay_for(2), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_backoff_exhausts_after_max_attempts() {
        let p = policy();
        assert_eq!(p.delay_for(3), None);
        assert_eq!(p.delay_for(100), None);
    }

    #[test]
    fn test_backoff_is_capped_and_non_decreasing() {
        let p = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        };
        let mut last = Duration::ZERO;
        for attempt in 0..10 {
            let delay = p.delay_for(attempt).unwrap();
            assert!(delay >= last, "delay shrank at attempt {}", attempt);
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        assert_eq!(p.delay_for(6), Some(Duration::from_secs(30)));
        assert_eq!(p.delay_for(9), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: u32::MAX,
        };
        assert_eq!(p.delay_for(40), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Recovering { attempt: 2 }).unwrap();
        assert_eq!(json, r#"{"state":"recovering","attempt":2}"#);
        let json = serde_json::to_string(&AgentStatus::Thinking).unwrap();
        assert_eq!(json, r#""thinking""#);
    }
}
