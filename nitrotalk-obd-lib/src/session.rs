//! ELM327 Session Protocol Engine
//!
//! Two halves share one mutex:
//! - [`SessionShared`] is the link listener. It runs on the link task's
//!   thread, frames incoming bytes into lines, classifies them, and updates
//!   the signals and the telemetry snapshot. It never blocks beyond the lock.
//! - [`Elm327Session`] is driven by the scheduler thread. It sends commands
//!   and waits on the condition variable for the prompt, a decoded response,
//!   an ECU reply, or a link change.
//!
//! Every link up/down bumps an epoch; a waiter that sees the epoch move gives
//! up at once with [`SessionError::Disconnected`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use atomic_enum::atomic_enum;
use log::{debug, info, warn};
use nitrotalk_elm327_lib::commands::{MAX_COMMAND_LEN, RESET, SUPPORTED_PIDS};
use nitrotalk_elm327_lib::{
    classify, decode_mode01, starts_with_mode01_ack, AdapterError, Frame, LineFramer,
    MultiFrameAssembler, Response, Telemetry, Terminator,
};
use nitrotalk_link_lib::{LinkListener, LinkWriter};
use serde::Serialize;

use crate::config::SessionConfig;
use crate::health::{AdapterErrorCounts, EcuState};
use crate::polling::RoundTrip;
use crate::status::Status;
use crate::SessionError;

#[atomic_enum]
#[derive(PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized = 0,
    Resetting,
    Configuring,
    Ready,
}

/// What the ECU said to the supported-PIDs probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcuReply {
    Ack,
    Negative(AdapterError),
}

/// Monotonic counters a waiter compares against to see what arrived after
/// its command went out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marks {
    /// Non-empty, non-`SEARCHING` lines
    pub responses: u64,
    /// Lines that updated at least one telemetry field
    pub decodes: u64,
}

#[derive(Default)]
struct Signals {
    link_up: bool,
    writable: bool,
    epoch: u64,
    /// `>` seen since the last command went out
    prompt: bool,
    marks: Marks,
    ecu_reply: Option<EcuReply>,
    searching: u32,
    search_stalled: bool,
    multi_frame: MultiFrameAssembler,
    telemetry: Telemetry,
    errors: AdapterErrorCounts,
}

impl Signals {
    fn on_frame(&mut self, frame: Frame<'_>, status: &Status, stall_threshold: u32, now: Instant) {
        let text = frame.text.trim();
        if !text.is_empty() {
            info!("⬇️ RECV: {text}");
            self.on_line(text, status, stall_threshold, now);
        }
        if frame.terminator == Terminator::Prompt {
            if let Some(partial) = self.multi_frame.flush() {
                debug!("Multi-frame reply cut short at the prompt");
                self.on_payload(&partial, status, now);
            }
            self.prompt = true;
        }
    }

    fn on_line(&mut self, line: &str, status: &Status, stall_threshold: u32, now: Instant) {
        match classify(line) {
            Response::Empty => return,
            Response::Searching => {
                self.searching += 1;
                debug!("Adapter searching for a protocol ({}x)", self.searching);
                if self.searching >= stall_threshold {
                    self.searching = 0;
                    self.search_stalled = true;
                }
                return;
            }
            Response::Identification(id) => info!("📟 Adapter: {id}"),
            Response::Ok => {}
            Response::Error(kind) => {
                self.multi_frame.reset();
                self.errors.record(kind);
                debug!("Adapter error {kind} ({} in a row)", self.errors.consecutive);
                if kind.is_ecu_negative() && self.ecu_reply.is_none() {
                    self.ecu_reply = Some(EcuReply::Negative(kind));
                }
            }
            Response::Voltage { millivolts } => {
                info!("🔋 Adapter voltage: {millivolts} mV");
                status.set_adapter_millivolts(millivolts);
            }
            Response::Data(data) => {
                if let Some(payload) = self.multi_frame.push(data) {
                    self.on_payload(&payload, status, now);
                }
            }
        }
        self.searching = 0;
        self.marks.responses += 1;
    }

    /// A complete response: one data line or a joined multi-frame reply
    fn on_payload(&mut self, payload: &str, status: &Status, now: Instant) {
        if starts_with_mode01_ack(payload) {
            self.ecu_reply = Some(EcuReply::Ack);
        }
        let values = decode_mode01(payload);
        if !values.is_empty() {
            let fields = self.telemetry.apply(&values, now);
            debug!("Decoded {fields:?}");
            self.errors.decay();
            self.marks.decodes += 1;
            status.publish_telemetry(&self.telemetry);
        }
    }
}

struct Inner {
    framer: LineFramer,
    signals: Signals,
}

/// Listener half of the session, registered with the connection manager
pub struct SessionShared {
    inner: Mutex<Inner>,
    changed: Condvar,
    status: Arc<Status>,
    search_stall_threshold: u32,
}

impl SessionShared {
    pub fn new(config: &SessionConfig, status: Arc<Status>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                framer: LineFramer::new(),
                signals: Signals::default(),
            }),
            changed: Condvar::new(),
            status,
            search_stall_threshold: config.search_stall_threshold.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>, timeout: Duration) -> MutexGuard<'a, Inner> {
        self.changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub fn status(&self) -> &Arc<Status> {
        &self.status
    }

    pub fn telemetry(&self) -> Telemetry {
        self.lock().signals.telemetry
    }

    pub fn error_counts(&self) -> AdapterErrorCounts {
        self.lock().signals.errors
    }

    pub fn reset_error_counts(&self) {
        self.lock().signals.errors = AdapterErrorCounts::default();
    }

    pub fn marks(&self) -> Marks {
        self.lock().signals.marks
    }

    /// Changes on every link up and link down
    pub fn epoch(&self) -> u64 {
        self.lock().signals.epoch
    }

    /// Block until the link is up and has a write endpoint
    pub fn wait_link_writable(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.signals.link_up && inner.signals.writable {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self.wait(inner, deadline - now);
        }
    }

    /// Block until the link epoch differs from `epoch`
    pub fn wait_epoch_change(&self, epoch: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.signals.epoch != epoch {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self.wait(inner, deadline - now);
        }
    }

    /// Zero telemetry fields older than `max_age`
    pub fn sweep_stale(&self, max_age: Duration) {
        let mut inner = self.lock();
        let cleared = inner.signals.telemetry.sweep_stale(Instant::now(), max_age);
        if !cleared.is_empty() {
            self.status.publish_telemetry(&inner.signals.telemetry);
        }
    }
}

impl LinkListener for SessionShared {
    fn on_link_ready(&self, writable: bool) {
        let mut inner = self.lock();
        inner.framer.reset();
        let signals = &mut inner.signals;
        signals.link_up = true;
        signals.writable = writable;
        signals.epoch += 1;
        // Nothing is outstanding on a fresh link
        signals.prompt = true;
        signals.ecu_reply = None;
        signals.searching = 0;
        signals.search_stalled = false;
        signals.multi_frame.reset();
        drop(inner);

        info!("🔗 Adapter link up (writable: {writable})");
        self.status.set_session(SessionState::Uninitialized);
        self.changed.notify_all();
    }

    fn on_bytes(&self, data: &[u8]) {
        let now = Instant::now();
        let mut guard = self.lock();
        let Inner { framer, signals } = &mut *guard;
        framer.feed(data, |frame| {
            signals.on_frame(frame, &self.status, self.search_stall_threshold, now);
        });
        drop(guard);
        self.changed.notify_all();
    }

    fn on_link_lost(&self) {
        let mut inner = self.lock();
        inner.framer.reset();
        let signals = &mut inner.signals;
        signals.link_up = false;
        signals.writable = false;
        signals.epoch += 1;
        signals.prompt = false;
        signals.ecu_reply = None;
        signals.searching = 0;
        signals.search_stalled = false;
        signals.multi_frame.reset();
        signals.telemetry.clear();
        self.status.publish_telemetry(&signals.telemetry);
        drop(inner);

        warn!("🔗 Adapter link lost");
        self.status.set_session(SessionState::Uninitialized);
        self.status.set_ecu(EcuState::Unverified);
        self.changed.notify_all();
    }
}

/// Command half of the session, owned by the scheduler thread
pub struct Elm327Session<W: LinkWriter> {
    shared: Arc<SessionShared>,
    writer: W,
    config: SessionConfig,
    last_command: Option<String>,
}

impl<W: LinkWriter> Elm327Session<W> {
    pub fn new(shared: Arc<SessionShared>, writer: W, config: SessionConfig) -> Self {
        Self {
            shared,
            writer,
            config,
            last_command: None,
        }
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.session()
    }

    /// Transmit `command` followed by a carriage return
    ///
    /// With `wait_for_ready` the adapter's prompt is awaited first (up to the
    /// prompt timeout, after which the command is sent anyway). Never queues:
    /// without a writable link this fails at once.
    pub fn send(&mut self, command: &str, wait_for_ready: bool) -> Result<(), SessionError> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(SessionError::CommandTooLong);
        }
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.lock();
        if !inner.signals.link_up || !inner.signals.writable {
            return Err(SessionError::NotReady);
        }
        if wait_for_ready {
            let epoch = inner.signals.epoch;
            let deadline = Instant::now() + self.config.prompt_timeout();
            while !inner.signals.prompt {
                if inner.signals.epoch != epoch {
                    return Err(SessionError::Disconnected);
                }
                let now = Instant::now();
                if now >= deadline {
                    debug!("No prompt after {:?}, sending {command} anyway", self.config.prompt_timeout());
                    break;
                }
                inner = shared.wait(inner, deadline - now);
            }
        }
        // A stall belongs to the command it interrupted
        let signals = &mut inner.signals;
        signals.prompt = false;
        signals.searching = 0;
        signals.search_stalled = false;
        drop(inner);

        info!("⬆️ SEND: {command}");
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        self.last_command = Some(command.to_string());
        self.writer.write(line.as_bytes())?;
        Ok(())
    }

    /// Sleep, returning early if the link goes away
    pub fn pause(&self, duration: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + duration;
        let mut inner = self.shared.lock();
        let epoch = inner.signals.epoch;
        loop {
            if inner.signals.epoch != epoch || !inner.signals.link_up {
                return Err(SessionError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            inner = self.shared.wait(inner, deadline - now);
        }
    }

    /// Wait until `done` holds (`Ok(true)`) or `timeout` passes (`Ok(false)`).
    /// Re-issues the last command if the adapter's bus search stalls.
    fn wait_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&Signals) -> bool,
    ) -> Result<bool, SessionError> {
        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + timeout;
        let mut inner = shared.lock();
        let epoch = inner.signals.epoch;
        loop {
            if inner.signals.epoch != epoch || !inner.signals.link_up {
                return Err(SessionError::Disconnected);
            }
            if done(&inner.signals) {
                return Ok(true);
            }
            if inner.signals.search_stalled {
                inner.signals.search_stalled = false;
                drop(inner);
                self.reissue_after_search_stall()?;
                inner = shared.lock();
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            inner = shared.wait(inner, deadline - now);
        }
    }

    fn reissue_after_search_stall(&mut self) -> Result<(), SessionError> {
        let Some(command) = self.last_command.clone() else {
            return Ok(());
        };
        warn!("Adapter bus search stalled, re-issuing {command}");
        self.pause(Duration::from_millis(self.config.search_retry_wait_ms))?;
        self.send(&command, false)
    }

    /// Run the configured initialization profile
    ///
    /// Every command is paced by the prompt and followed by its settle delay.
    /// What the adapter answers does not matter here, any answer is liveness.
    /// A send failure aborts and leaves the session `Uninitialized`.
    pub fn initialize(&mut self) -> Result<(), SessionError> {
        let profile = self.config.init_profile;
        info!("🔧 Initializing adapter ({profile:?} profile)");
        for step in profile.steps() {
            let state = if step.command == RESET {
                SessionState::Resetting
            } else {
                SessionState::Configuring
            };
            self.shared.status.set_session(state);
            info!("{}...", step.description);
            let settle = self.config.settle(step.settle);
            if let Err(e) = self.send(step.command, true).and_then(|()| self.pause(settle)) {
                warn!("❌ Initialization aborted at {}: {e}", step.command);
                self.shared.status.set_session(SessionState::Uninitialized);
                return Err(e);
            }
        }
        self.shared.status.set_session(SessionState::Ready);
        info!("✅ Adapter initialized");
        Ok(())
    }

    /// Bounded ECU connectivity check: `Ok(true)` once the ECU acknowledged a
    /// supported-PIDs request, `Ok(false)` after all retries went unanswered
    /// or were refused.
    pub fn probe_ecu(&mut self) -> Result<bool, SessionError> {
        let retries = self.config.ecu_probe_retries.max(1);
        let timeout = Duration::from_millis(self.config.ecu_probe_timeout_ms);
        for attempt in 1..=retries {
            self.shared.lock().signals.ecu_reply = None;
            // The adapter may take seconds searching the bus, don't wait for a prompt
            self.send(SUPPORTED_PIDS, false)?;
            self.wait_until(timeout, |s| s.ecu_reply.is_some())?;

            let reply = self.shared.lock().signals.ecu_reply;
            match reply {
                Some(EcuReply::Ack) => return Ok(true),
                Some(EcuReply::Negative(kind)) => info!("ECU probe {attempt}/{retries}: {kind}"),
                None => info!("ECU probe {attempt}/{retries}: no answer in {timeout:?}"),
            }
            if attempt < retries {
                self.pause(Duration::from_millis(self.config.ecu_probe_pause_ms))?;
            }
        }
        Ok(false)
    }

    /// One polling round trip: send, then wait for the prompt or a decode
    pub fn request(&mut self, command: &str, timeout: Duration) -> Result<RoundTrip, SessionError> {
        let before = self.shared.marks();
        self.send(command, true)?;
        self.wait_until(timeout, |s| s.prompt || s.marks.decodes > before.decodes)?;
        let after = self.shared.marks();
        Ok(if after.decodes > before.decodes {
            RoundTrip::Success
        } else if after.responses > before.responses {
            RoundTrip::SoftFailure
        } else {
            RoundTrip::NoResponse
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_session_config, status, SimWire};
    use nitrotalk_elm327_lib::{SimulatedAdapter, TelemetryValues, VehicleState};
    use nitrotalk_link_lib::LinkError;

    fn session(wire: &SimWire) -> Elm327Session<SimWire> {
        Elm327Session::new(wire.shared.clone(), wire.clone(), fast_session_config())
    }

    #[test]
    fn test_send_without_link_is_not_ready() {
        let wire = SimWire::new(VehicleState::default());
        let mut s = session(&wire);
        assert_eq!(s.send("ATZ", true), Err(SessionError::NotReady));
        assert!(wire.sent().is_empty());

        // Receive-only link: still no sending
        wire.shared.on_link_ready(false);
        assert_eq!(s.send("ATZ", true), Err(SessionError::NotReady));
    }

    #[test]
    fn test_command_length_limit() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        assert_eq!(s.send(&"0".repeat(40), false), Err(SessionError::CommandTooLong));
    }

    #[test]
    fn test_initialize_full_profile() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        s.initialize().unwrap();
        assert_eq!(s.state(), SessionState::Ready);

        let sent = wire.sent();
        assert_eq!(sent.first().map(String::as_str), Some("ATZ\r"));
        assert_eq!(sent.last().map(String::as_str), Some("0100\r"));
        assert_eq!(sent.len(), 11);
        assert_eq!(wire.shared.status().adapter_millivolts(), 12_400);
    }

    #[test]
    fn test_initialize_compact_profile() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut config = fast_session_config();
        config.init_profile = nitrotalk_elm327_lib::InitProfile::Compact;
        let mut s = Elm327Session::new(wire.shared.clone(), wire.clone(), config);
        s.initialize().unwrap();
        assert!(wire.sent().contains(&"ATSP0\r".to_string()));
        assert!(!wire.sent().contains(&"AT SH 7DF\r".to_string()));
    }

    #[test]
    fn test_initialize_aborts_on_write_failure() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.fail_after(3);
        let mut s = session(&wire);
        assert_eq!(
            s.initialize(),
            Err(SessionError::Link {
                source: LinkError::Transport { code: -1 }
            })
        );
        assert_eq!(s.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_probe_success_and_refusal() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        assert_eq!(s.probe_ecu(), Ok(true));

        wire.adapter().vehicle.ecu_online = false;
        assert_eq!(s.probe_ecu(), Ok(false));
        // Every retry went out
        let probes = wire.sent().iter().filter(|c| *c == "0100\r").count();
        assert_eq!(probes, 1 + 3);
        assert!(wire.shared.error_counts().unable_to_connect >= 3);
    }

    #[test]
    fn test_search_stall_reissues_probe() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.set_manual(true);
        let mut s = session(&wire);

        let shared = wire.shared.clone();
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.on_bytes(b"SEARCHING...\rSEARCHING...\rSEARCHING...\r");
        });
        // Nothing answers the re-issued probe; it must still have gone out
        assert_eq!(s.probe_ecu(), Ok(false));
        feeder.join().unwrap();
        let probes = wire.sent().iter().filter(|c| *c == "0100\r").count();
        assert!(probes >= 4, "sent: {:?}", wire.sent());
    }

    #[test]
    fn test_send_clears_earlier_search_stall() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        s.send("ATDPN", true).unwrap();
        // Stall reported while nobody waits, e.g. during an init settle
        wire.shared.on_bytes(b"SEARCHING...\rSEARCHING...\rSEARCHING...\r");

        wire.set_manual(true);
        assert_eq!(
            s.request("010C", Duration::from_millis(30)),
            Ok(RoundTrip::NoResponse)
        );
        let requests = wire.sent().iter().filter(|c| *c == "010C\r").count();
        assert_eq!(requests, 1, "sent: {:?}", wire.sent());
    }

    #[test]
    fn test_stall_during_init_does_not_repeat_next_check() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        s.initialize().unwrap();
        wire.shared.on_bytes(b"SEARCHING...\rSEARCHING...\rSEARCHING...\r");

        wire.set_manual(true);
        assert_eq!(s.probe_ecu(), Ok(false));
        // One from initialization, then one per retry
        let checks = wire.sent().iter().filter(|c| *c == "0100\r").count();
        assert_eq!(checks, 1 + 3, "sent: {:?}", wire.sent());
    }

    #[test]
    fn test_multi_frame_reply_decodes_all_fields() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let before = wire.shared.marks();
        wire.shared.on_bytes(b"008\r0: 41 0C 2E E0 11 FF\r");
        assert_eq!(wire.shared.marks().decodes, before.decodes);
        wire.shared.on_bytes(b"1: 0D 3C 00 00 00 00 00\r\r>");
        assert_eq!(wire.shared.marks().decodes - before.decodes, 1);
        assert_eq!(
            wire.shared.status().telemetry(),
            TelemetryValues {
                rpm: 3000,
                throttle_pct: 100,
                speed_kmh: 60
            }
        );
    }

    #[test]
    fn test_request_over_can_frames() {
        let vehicle = VehicleState {
            rpm: 3000,
            throttle_pct: 100,
            speed_kmh: 60,
            ..VehicleState::default()
        };
        let wire = SimWire::new(vehicle);
        *wire.adapter() = SimulatedAdapter::new(vehicle).with_can_frames();
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        s.send("ATE0", true).unwrap();

        assert_eq!(s.request("010C110D", Duration::from_millis(50)), Ok(RoundTrip::Success));
        assert_eq!(wire.shared.status().telemetry().speed_kmh, 60);
        assert_eq!(wire.shared.status().telemetry().rpm, 3000);
    }

    #[test]
    fn test_multi_frame_cut_short_at_prompt() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.shared.on_bytes(b"008\r0: 41 0C 2E E0 11 FF\r\r>");
        let telemetry = wire.shared.telemetry();
        assert_eq!(telemetry.rpm.value, 3000);
        assert_eq!(telemetry.throttle_pct.value, 100);
        assert_eq!(telemetry.speed_kmh.value, 0);
    }

    #[test]
    fn test_error_abandons_multi_frame_reply() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.shared.on_bytes(b"008\r0: 41 0C 2E E0 11 FF\rCAN ERROR\r\r>");
        assert_eq!(wire.shared.telemetry(), Telemetry::default());
        assert_eq!(wire.shared.error_counts().can_error, 1);
    }

    #[test]
    fn test_request_outcomes() {
        let wire = SimWire::new(VehicleState {
            rpm: 3000,
            throttle_pct: 100,
            speed_kmh: 60,
            ..VehicleState::default()
        });
        wire.shared.on_link_ready(true);
        let mut s = session(&wire);
        s.send("ATE0", true).unwrap();

        let timeout = Duration::from_millis(50);
        assert_eq!(s.request("010C110D", timeout), Ok(RoundTrip::Success));
        assert_eq!(
            wire.shared.status().telemetry(),
            TelemetryValues {
                rpm: 3000,
                throttle_pct: 100,
                speed_kmh: 60
            }
        );

        wire.adapter().vehicle.ecu_online = false;
        assert_eq!(s.request("010C", timeout), Ok(RoundTrip::SoftFailure));
        assert_eq!(wire.shared.error_counts().no_data, 1);

        wire.set_manual(true);
        assert_eq!(s.request("010C", timeout), Ok(RoundTrip::NoResponse));
    }

    #[test]
    fn test_link_loss_aborts_wait() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.set_manual(true);
        let mut s = session(&wire);

        let shared = wire.shared.clone();
        let dropper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.on_link_lost();
        });
        let started = Instant::now();
        assert_eq!(
            s.request("010C", Duration::from_secs(5)),
            Err(SessionError::Disconnected)
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        dropper.join().unwrap();
        assert_eq!(s.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_link_loss_clears_telemetry() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        wire.shared.on_bytes(b"41 0C 2E E0\r>");
        assert_eq!(wire.shared.telemetry().rpm.value, 3000);
        wire.shared.on_link_lost();
        assert_eq!(wire.shared.telemetry(), Telemetry::default());
        assert_eq!(wire.shared.status().telemetry().rpm, 0);
    }

    #[test]
    fn test_split_notifications_and_prompt() {
        let wire = SimWire::new(VehicleState::default());
        wire.shared.on_link_ready(true);
        let before = wire.shared.marks();
        wire.shared.on_bytes(b"41 0D");
        wire.shared.on_bytes(b" 3C\r");
        wire.shared.on_bytes(b"NO DATA\r\r>");
        let after = wire.shared.marks();
        assert_eq!(after.decodes - before.decodes, 1);
        assert_eq!(after.responses - before.responses, 2);
        assert_eq!(wire.shared.telemetry().speed_kmh.value, 60);
    }
}
