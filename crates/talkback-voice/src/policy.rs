//! Recovery policy: how fast to reopen capture after the engine drops a session,
//! and when a failed dialogue round trip is worth a second attempt.

use crate::capture::EndReason;
use crate::config::ControllerPolicy;
use crate::error::DialogueFailure;
use std::time::Duration;
use tokio::time::Instant;

/// What to do after capture ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    /// Wait this long before reopening capture.
    pub delay: Duration,
    /// Tell the user that capture keeps failing (fires once per streak).
    pub notify: bool,
}

/// Tracks consecutive transport errors and turns them into a growing delay
/// (0, step, 2·step, ... capped).
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    step: Duration,
    max: Duration,
    window: Duration,
    notice_threshold: u32,
    streak: u32,
    last_error: Option<Instant>,
    notified: bool,
}

impl RestartBackoff {
    pub fn new(policy: &ControllerPolicy) -> Self {
        Self {
            step: policy.backoff_step(),
            max: policy.backoff_max(),
            window: policy.error_window(),
            notice_threshold: policy.capture_failure_notice_threshold,
            streak: 0,
            last_error: None,
            notified: false,
        }
    }

    pub fn on_ended(&mut self, reason: EndReason, now: Instant) -> RestartDecision {
        match reason {
            EndReason::TransportError => {
                let stale = self
                    .last_error
                    .map(|last| now.saturating_duration_since(last) > self.window)
                    .unwrap_or(false);
                if stale {
                    self.reset();
                }

                self.streak += 1;
                self.last_error = Some(now);

                let delay = self.step.saturating_mul(self.streak - 1).min(self.max);
                let notify = self.streak >= self.notice_threshold && !self.notified;
                if notify {
                    self.notified = true;
                }
                RestartDecision { delay, notify }
            }
            EndReason::NaturalTimeout | EndReason::StoppedByCaller => RestartDecision {
                delay: Duration::ZERO,
                notify: false,
            },
        }
    }

    /// Capture produced text, so the engine is healthy again.
    pub fn on_transcript(&mut self) {
        self.reset();
    }

    pub fn reset(&mut self) {
        self.streak = 0;
        self.last_error = None;
        self.notified = false;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// Retry a failed dialogue send when the failure is transient and the turn still
/// has retries left.
pub fn should_retry(failure: &DialogueFailure, retries_used: u32, retry_limit: u32) -> bool {
    failure.is_retryable() && retries_used < retry_limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RestartBackoff {
        RestartBackoff::new(&ControllerPolicy::default())
    }

    #[test]
    fn transport_errors_back_off_linearly_and_cap() {
        let mut b = backoff();
        let t0 = Instant::now();
        let delays: Vec<u64> = (0..12u64)
            .map(|i| {
                b.on_ended(EndReason::TransportError, t0 + Duration::from_millis(i * 100))
                    .delay
                    .as_millis() as u64
            })
            .collect();
        assert_eq!(&delays[..4], &[0, 500, 1000, 1500]);
        assert_eq!(*delays.last().unwrap(), 4000);
    }

    #[test]
    fn notice_fires_once_at_threshold() {
        let mut b = backoff();
        let t0 = Instant::now();
        let notices: Vec<bool> = (0..5u64)
            .map(|i| {
                b.on_ended(EndReason::TransportError, t0 + Duration::from_millis(i))
                    .notify
            })
            .collect();
        assert_eq!(notices, vec![false, false, true, false, false]);
    }

    #[test]
    fn natural_timeout_restarts_immediately_without_touching_streak() {
        let mut b = backoff();
        let t0 = Instant::now();
        b.on_ended(EndReason::TransportError, t0);
        let d = b.on_ended(EndReason::NaturalTimeout, t0);
        assert_eq!(d.delay, Duration::ZERO);
        assert_eq!(b.streak(), 1);
    }

    #[test]
    fn quiet_period_starts_a_new_streak() {
        let mut b = backoff();
        let t0 = Instant::now();
        b.on_ended(EndReason::TransportError, t0);
        b.on_ended(EndReason::TransportError, t0 + Duration::from_millis(10));
        let later = b.on_ended(EndReason::TransportError, t0 + Duration::from_secs(60));
        assert_eq!(later.delay, Duration::ZERO);
        assert_eq!(b.streak(), 1);
    }

    #[test]
    fn transcript_resets_streak() {
        let mut b = backoff();
        let t0 = Instant::now();
        b.on_ended(EndReason::TransportError, t0);
        b.on_ended(EndReason::TransportError, t0);
        b.on_transcript();
        assert_eq!(b.on_ended(EndReason::TransportError, t0).delay, Duration::ZERO);
    }

    #[test]
    fn retry_only_transient_failures_within_limit() {
        assert!(should_retry(&DialogueFailure::Timeout, 0, 1));
        assert!(should_retry(&DialogueFailure::Network("reset".into()), 0, 1));
        assert!(!should_retry(&DialogueFailure::Network("reset".into()), 1, 1));
        assert!(!should_retry(
            &DialogueFailure::Server {
                status: 500,
                message: "boom".into()
            },
            0,
            1
        ));
    }
}
