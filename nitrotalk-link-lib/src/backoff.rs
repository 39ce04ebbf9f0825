//! Backoff for repeated identical link failures
//!
//! An adapter that is in range but incompatible (or half-paired) fails the
//! same way every time. Retrying at full speed just hammers it, so the same
//! failure repeating inside a short window doubles the delay before the next
//! scan, up to a ceiling. A different failure, or one outside the window,
//! starts over.

use std::time::{Duration, Instant};

use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignature {
    /// Connect request rejected or failed, with the transport status
    ConnectFailed { status: i32 },
    /// Link dropped by the peer or the controller, with the reason code
    Disconnected { reason: i32 },
    /// Connected, but no usable UART service or notify endpoint
    DiscoveryFailed,
}

#[derive(Debug)]
pub struct FailureBackoff {
    window: Duration,
    base: Duration,
    max: Duration,
    last: Option<(FailureSignature, Instant)>,
    delay: Duration,
}

impl FailureBackoff {
    pub fn new(window: Duration, base: Duration, max: Duration) -> Self {
        Self {
            window,
            base,
            max,
            last: None,
            delay: Duration::ZERO,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn record(&mut self, signature: FailureSignature, now: Instant) -> Duration {
        let repeated = self.last.is_some_and(|(last_sig, at)| {
            last_sig == signature && now.saturating_duration_since(at) <= self.window
        });

        self.delay = if !repeated {
            Duration::ZERO
        } else if self.delay.is_zero() {
            self.base
        } else {
            (self.delay * 2).min(self.max)
        };
        self.last = Some((signature, now));

        if self.delay.is_zero() {
            debug!("Link failure {signature:?}, retrying immediately");
        } else {
            warn!("🔁 Repeated link failure {signature:?}, backing off {:?}", self.delay);
        }
        self.delay
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.delay = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> FailureBackoff {
        FailureBackoff::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(4),
        )
    }

    #[test]
    fn test_first_failure_is_immediate() {
        let mut b = backoff();
        let now = Instant::now();
        assert_eq!(b.record(FailureSignature::DiscoveryFailed, now), Duration::ZERO);
    }

    #[test]
    fn test_repeats_double_up_to_max() {
        let mut b = backoff();
        let sig = FailureSignature::Disconnected { reason: 0x13 };
        let mut now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(b.record(sig, now).as_secs());
            now += Duration::from_secs(2);
        }
        assert_eq!(delays, vec![0, 1, 2, 4, 4, 4]);
    }

    #[test]
    fn test_different_signature_resets() {
        let mut b = backoff();
        let now = Instant::now();
        let sig = FailureSignature::ConnectFailed { status: 133 };
        b.record(sig, now);
        assert_eq!(b.record(sig, now), Duration::from_secs(1));
        let other = FailureSignature::ConnectFailed { status: 8 };
        assert_eq!(b.record(other, now), Duration::ZERO);
    }

    #[test]
    fn test_outside_window_resets() {
        let mut b = backoff();
        let sig = FailureSignature::DiscoveryFailed;
        let now = Instant::now();
        b.record(sig, now);
        b.record(sig, now + Duration::from_secs(1));
        assert_eq!(b.current_delay(), Duration::from_secs(1));
        assert_eq!(b.record(sig, now + Duration::from_secs(30)), Duration::ZERO);
    }
}
