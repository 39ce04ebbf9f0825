//! Recovery watchdogs for a connection manager
//!
//! Independent of the data path; the link task calls [`Supervisor::tick`] on
//! every loop pass.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::LinkConfig;
use crate::{ConnectionState, Link};

pub struct Supervisor {
    idle_check: Duration,
    stuck_after: Duration,
    hard_reset_after: u32,
    scan_limit: Duration,
    next_idle_check: Instant,
    /// Stuck detections since the link was last `Ready`
    stuck_detections: u32,
    /// Entry time of the attempt already counted as stuck
    counted_attempt: Option<Instant>,
}

impl Supervisor {
    pub fn new(config: &LinkConfig, now: Instant) -> Self {
        let idle_check = Duration::from_millis(config.idle_check_ms);
        Self {
            idle_check,
            stuck_after: Duration::from_millis(config.stuck_connect_ms),
            hard_reset_after: config.hard_reset_after.max(1),
            scan_limit: config.scan_duration() + Duration::from_millis(config.scan_grace_ms),
            next_idle_check: now + idle_check,
            stuck_detections: 0,
            counted_attempt: None,
        }
    }

    pub fn stuck_detections(&self) -> u32 {
        self.stuck_detections
    }

    pub fn tick<L: Link>(&mut self, link: &mut L, now: Instant) {
        let state = link.state();
        let in_state = now.saturating_duration_since(link.state_since());

        if state == ConnectionState::Ready {
            self.stuck_detections = 0;
            self.counted_attempt = None;
        }

        // Stuck connect: the attempt never completes and never fails
        if state.is_establishing() && in_state > self.stuck_after {
            let since = link.state_since();
            if self.counted_attempt != Some(since) {
                self.counted_attempt = Some(since);
                self.stuck_detections += 1;
                if self.stuck_detections >= self.hard_reset_after {
                    warn!(
                        "🧱 Stuck in {state:?} for {in_state:?} ({} detections), hard resetting",
                        self.stuck_detections
                    );
                    self.stuck_detections = 0;
                    self.counted_attempt = None;
                    link.hard_reset(now);
                } else {
                    warn!("🧱 Stuck in {state:?} for {in_state:?}, dropping the attempt");
                    link.disconnect(now);
                }
                return;
            }
        }

        // Scan that outlived its own duration (lost completion event)
        if state == ConnectionState::Scanning && in_state > self.scan_limit {
            warn!("⏱️ Scan running for {in_state:?}, stopping it");
            link.stop_scan(now);
            return;
        }

        if now >= self.next_idle_check {
            self.next_idle_check = now + self.idle_check;
            if state.is_idle() {
                info!("Idle watchdog: no link activity, starting discovery");
                link.start_discovery(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkError;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Start,
        StopScan,
        Disconnect,
        HardReset,
    }

    struct FakeLink {
        state: ConnectionState,
        since: Instant,
        actions: Vec<Action>,
    }

    impl FakeLink {
        fn new(state: ConnectionState, since: Instant) -> Self {
            Self {
                state,
                since,
                actions: Vec::new(),
            }
        }

        fn enter(&mut self, state: ConnectionState, at: Instant) {
            self.state = state;
            self.since = at;
        }
    }

    impl Link for FakeLink {
        type Event = ();

        fn handle_event(&mut self, _event: (), _now: Instant) {}

        fn poll(&mut self, _now: Instant) {}

        fn state(&self) -> ConnectionState {
            self.state
        }

        fn state_since(&self) -> Instant {
            self.since
        }

        fn start_discovery(&mut self, now: Instant) {
            self.actions.push(Action::Start);
            self.enter(ConnectionState::Scanning, now);
        }

        fn stop_scan(&mut self, now: Instant) {
            self.actions.push(Action::StopScan);
            self.enter(ConnectionState::Idle, now);
        }

        fn disconnect(&mut self, now: Instant) {
            self.actions.push(Action::Disconnect);
            self.enter(ConnectionState::Disconnected, now);
        }

        fn hard_reset(&mut self, now: Instant) {
            self.actions.push(Action::HardReset);
            self.enter(ConnectionState::Scanning, now);
        }

        fn write(&mut self, _data: &[u8]) -> Result<(), LinkError> {
            Err(LinkError::NotReady)
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_idle_watchdog_restarts_discovery() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(&LinkConfig::default(), t0);
        let mut link = FakeLink::new(ConnectionState::Disconnected, t0);

        sup.tick(&mut link, t0 + secs(5));
        assert!(link.actions.is_empty());
        sup.tick(&mut link, t0 + secs(10));
        assert_eq!(link.actions, vec![Action::Start]);
    }

    #[test]
    fn test_idle_watchdog_leaves_active_link_alone() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(&LinkConfig::default(), t0);
        let mut link = FakeLink::new(ConnectionState::Ready, t0);
        for s in 0..60 {
            sup.tick(&mut link, t0 + secs(s));
        }
        assert!(link.actions.is_empty());
    }

    #[test]
    fn test_stuck_connect_counted_once_per_attempt() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(&LinkConfig::default(), t0);
        let mut link = FakeLink::new(ConnectionState::Connecting, t0);

        sup.tick(&mut link, t0 + secs(15));
        assert!(link.actions.is_empty());
        sup.tick(&mut link, t0 + secs(16));
        assert_eq!(link.actions, vec![Action::Disconnect]);
        assert_eq!(sup.stuck_detections(), 1);

        // Second wedged attempt escalates to a hard reset
        link.enter(ConnectionState::Connecting, t0 + secs(20));
        sup.tick(&mut link, t0 + secs(36));
        assert_eq!(link.actions, vec![Action::Disconnect, Action::HardReset]);
        assert_eq!(sup.stuck_detections(), 0);
    }

    #[test]
    fn test_ready_resets_stuck_count() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(&LinkConfig::default(), t0);
        let mut link = FakeLink::new(ConnectionState::Connecting, t0);
        sup.tick(&mut link, t0 + secs(16));
        assert_eq!(sup.stuck_detections(), 1);

        link.enter(ConnectionState::Ready, t0 + secs(17));
        sup.tick(&mut link, t0 + secs(18));
        assert_eq!(sup.stuck_detections(), 0);

        link.enter(ConnectionState::DiscoveringServices, t0 + secs(20));
        sup.tick(&mut link, t0 + secs(36));
        assert_eq!(link.actions, vec![Action::Disconnect, Action::Disconnect]);
    }

    #[test]
    fn test_overlong_scan_is_stopped() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(&LinkConfig::default(), t0);
        let mut link = FakeLink::new(ConnectionState::Scanning, t0);
        sup.tick(&mut link, t0 + secs(31));
        assert!(link.actions.is_empty());
        sup.tick(&mut link, t0 + secs(33));
        assert_eq!(link.actions, vec![Action::StopScan]);
    }
}
