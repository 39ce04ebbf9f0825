//! Adaptive Polling Scheduler
//!
//! One thread walks the phases below. ECU loss sends it back to probing
//! without touching the link; link loss sends it back to waiting for the
//! link.
//!
//! ```text
//! AwaitLink -> Initialize -> Probe -> Poll
//!                              ^       |
//!                              +-------+  (ECU lost)
//! Probe -> Unreachable  (probe rounds exhausted, until the link is re-established)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nitrotalk_link_lib::LinkWriter;

use crate::config::PollingConfig;
use crate::health::HealthMonitor;
use crate::polling::{PollingController, Verdict};
use crate::session::Elm327Session;
use crate::status::Status;
use crate::SessionError;

/// Longest single block while waiting for link changes, so the shutdown
/// flag and the heartbeat are serviced
const LINK_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitLink,
    Initialize,
    Probe,
    Poll,
    Unreachable,
}

pub struct Scheduler<W: LinkWriter> {
    session: Elm327Session<W>,
    health: HealthMonitor,
    polling: PollingController,
    config: PollingConfig,
    status: Arc<Status>,
    phase: Phase,
    /// Link epoch the current adapter session was initialized on
    epoch: u64,
}

impl<W: LinkWriter> Scheduler<W> {
    pub fn new(session: Elm327Session<W>, config: PollingConfig) -> Self {
        let status = Arc::clone(session.shared().status());
        Self {
            health: HealthMonitor::new(Arc::clone(&status), config.probe_rounds),
            polling: PollingController::new(&config, Instant::now()),
            session,
            config,
            status,
            phase: Phase::AwaitLink,
            epoch: 0,
        }
    }

    pub fn session(&self) -> &Elm327Session<W> {
        &self.session
    }

    /// Run until `shutdown` is set. `heartbeat` is called between phases.
    pub fn run(&mut self, shutdown: &AtomicBool, mut heartbeat: impl FnMut()) {
        info!("Polling scheduler started");
        while !shutdown.load(Ordering::Relaxed) {
            heartbeat();
            self.step();
        }
        info!("Polling scheduler stopped");
    }

    /// Execute one unit of the current phase
    pub fn step(&mut self) {
        let next = match self.phase {
            Phase::AwaitLink => self.await_link(),
            Phase::Initialize => self.initialize(),
            Phase::Probe => self.probe(),
            Phase::Poll => self.poll(),
            Phase::Unreachable => self.unreachable(),
        };
        if next != self.phase {
            debug!("Scheduler: {:?} -> {next:?}", self.phase);
            self.phase = next;
        }
        // Display freshness, independent of ECU health
        self.session
            .shared()
            .sweep_stale(self.polling.staleness_timeout());
    }

    fn await_link(&mut self) -> Phase {
        let shared = self.session.shared();
        if shared.wait_link_writable(LINK_WAIT) {
            self.epoch = shared.epoch();
            Phase::Initialize
        } else {
            Phase::AwaitLink
        }
    }

    fn initialize(&mut self) -> Phase {
        self.health.reset();
        let settle = Duration::from_millis(self.session.config().post_connect_settle_ms);
        let result = self
            .session
            .pause(settle)
            .and_then(|()| self.session.initialize());
        match result {
            Ok(()) => Phase::Probe,
            Err(e) => self.on_session_error(e),
        }
    }

    fn probe(&mut self) -> Phase {
        self.health.begin_probe();
        match self.session.probe_ecu() {
            Ok(true) => {
                self.health.probe_succeeded();
                self.polling.reset(Instant::now());
                self.publish_polling();
                Phase::Poll
            }
            Ok(false) => {
                if self.health.probe_failed() {
                    return Phase::Unreachable;
                }
                match self.session.pause(self.config.probe_round_delay()) {
                    Ok(()) => Phase::Probe,
                    Err(e) => self.on_session_error(e),
                }
            }
            Err(e) => self.on_session_error(e),
        }
    }

    fn poll(&mut self) -> Phase {
        let command = self.polling.next_request();
        let outcome = match self.session.request(command, self.config.response_timeout()) {
            Ok(outcome) => outcome,
            Err(e) => return self.on_session_error(e),
        };
        let verdict = self.polling.record(outcome, Instant::now());
        self.publish_polling();

        if verdict == Verdict::EcuLost {
            self.health.declare_lost();
            self.session.shared().reset_error_counts();
            self.polling.reset(Instant::now());
            self.publish_polling();
            return Phase::Probe;
        }

        match self.session.pause(self.polling.current_delay()) {
            Ok(()) => Phase::Poll,
            Err(e) => self.on_session_error(e),
        }
    }

    /// Stay quiet until the link is re-established
    fn unreachable(&mut self) -> Phase {
        if self.session.shared().wait_epoch_change(self.epoch, LINK_WAIT) {
            info!("Link changed, ECU will be probed again after re-initialization");
            Phase::AwaitLink
        } else {
            Phase::Unreachable
        }
    }

    fn on_session_error(&mut self, e: SessionError) -> Phase {
        match e {
            SessionError::Disconnected | SessionError::NotReady => {
                info!("Adapter link gone, waiting for it to come back");
            }
            e => warn!("Session error: {e}, re-initializing adapter"),
        }
        Phase::AwaitLink
    }

    fn publish_polling(&self) {
        let delay_ms = u32::try_from(self.polling.current_delay().as_millis()).unwrap_or(u32::MAX);
        self.status.set_polling(self.polling.mode(), delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_polling_config, fast_session_config, wait_for, SimWire};
    use nitrotalk_elm327_lib::VehicleState;
    use nitrotalk_link_lib::LinkListener;
    use std::thread::{self, JoinHandle};

    struct Running {
        wire: SimWire,
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Running {
        fn start(vehicle: VehicleState, config: PollingConfig) -> Self {
            let wire = SimWire::new(vehicle);
            let session = Elm327Session::new(wire.shared.clone(), wire.clone(), fast_session_config());
            let mut scheduler = Scheduler::new(session, config);
            let stop = Arc::new(AtomicBool::new(false));
            let flag = stop.clone();
            let thread = thread::spawn(move || scheduler.run(&flag, || {}));
            Self {
                wire,
                stop,
                thread: Some(thread),
            }
        }

        fn status(&self) -> &Arc<Status> {
            self.wire.shared.status()
        }

        fn probes_sent(&self) -> usize {
            self.wire.sent().iter().filter(|c| *c == "0100\r").count()
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            // Wake anything blocked on the session
            self.wire.shared.on_link_lost();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn vehicle() -> VehicleState {
        VehicleState {
            rpm: 3000,
            throttle_pct: 100,
            speed_kmh: 60,
            ..VehicleState::default()
        }
    }

    #[test]
    fn test_link_up_to_live_telemetry() {
        let run = Running::start(vehicle(), fast_polling_config());
        assert_eq!(run.status().telemetry().rpm, 0);
        run.wire.shared.on_link_ready(true);

        assert!(wait_for(|| run.status().ecu_connected()));
        assert!(wait_for(|| run.status().telemetry().rpm == 3000));
        let snapshot = run.status().snapshot();
        assert_eq!(snapshot.telemetry.speed_kmh, 60);
        assert_eq!(snapshot.telemetry.throttle_pct, 100);
        assert_eq!(snapshot.session, crate::SessionState::Ready);
        assert!(run.wire.sent().contains(&"010C110D\r".to_string()));
    }

    #[test]
    fn test_no_data_at_ceiling_declares_ecu_lost_and_reprobes() {
        let config = PollingConfig {
            min_delay_ms: 5,
            max_delay_ms: 5,
            // Keep probing until the ECU is back
            probe_rounds: 1000,
            ..fast_polling_config()
        };
        let run = Running::start(vehicle(), config);
        run.wire.shared.on_link_ready(true);
        assert!(wait_for(|| run.status().ecu_connected()));
        let probes = run.probes_sent();

        run.wire.adapter().vehicle.ecu_online = false;
        assert!(wait_for(|| run.status().snapshot().ecu_losses == 1));
        assert!(!run.status().ecu_connected());
        // The reconnection probe went out on the same link
        assert!(wait_for(|| run.probes_sent() > probes));
        assert!(run.status().transport_connected());

        // ECU comes back: connected again without a new link
        run.wire.adapter().vehicle.ecu_online = true;
        assert!(wait_for(|| run.status().ecu_connected()));
        assert_eq!(run.status().snapshot().ecu_losses, 1);
    }

    #[test]
    fn test_transient_errors_do_not_lose_ecu() {
        let run = Running::start(vehicle(), fast_polling_config());
        run.wire.shared.on_link_ready(true);
        assert!(wait_for(|| run.status().ecu_connected()));

        // Two failed round trips from the floor never reach the ceiling
        run.wire.adapter().vehicle.ecu_online = false;
        thread::sleep(Duration::from_millis(20));
        run.wire.adapter().vehicle.ecu_online = true;
        thread::sleep(Duration::from_millis(100));
        assert_eq!(run.status().snapshot().ecu_losses, 0);
        assert!(run.status().ecu_connected());
    }

    #[test]
    fn test_unreachable_until_link_reestablished() {
        let offline = VehicleState {
            ecu_online: false,
            ..vehicle()
        };
        let run = Running::start(offline, fast_polling_config());
        run.wire.shared.on_link_ready(true);
        assert!(wait_for(|| run.status().ecu_unreachable()));
        // Three rounds of three probes, plus the one in the init profile
        assert_eq!(run.probes_sent(), 3 * 3 + 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(run.probes_sent(), 3 * 3 + 1);

        run.wire.adapter().vehicle.ecu_online = true;
        run.wire.shared.on_link_lost();
        run.wire.shared.on_link_ready(true);
        assert!(wait_for(|| run.status().ecu_connected()));
        assert!(!run.status().ecu_unreachable());
    }
}
