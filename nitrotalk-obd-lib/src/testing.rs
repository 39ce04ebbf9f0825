//! A simulated adapter wired straight into a session listener

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nitrotalk_elm327_lib::{SimulatedAdapter, VehicleState};
use nitrotalk_link_lib::{AtomicConnectionState, ConnectionState, LinkError, LinkListener, LinkWriter};

use crate::config::{PollingConfig, SessionConfig};
use crate::session::SessionShared;
use crate::status::Status;

pub fn status() -> Arc<Status> {
    Arc::new(Status::new(Arc::new(AtomicConnectionState::new(
        ConnectionState::Ready,
    ))))
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        prompt_timeout_ms: 50,
        post_connect_settle_ms: 1,
        command_settle_ms: 1,
        reset_settle_ms: 1,
        diagnostic_settle_ms: 1,
        probe_settle_ms: 1,
        search_retry_wait_ms: 5,
        ecu_probe_timeout_ms: 100,
        ecu_probe_retries: 3,
        ecu_probe_pause_ms: 5,
        ..SessionConfig::default()
    }
}

pub fn fast_polling_config() -> PollingConfig {
    PollingConfig {
        min_delay_ms: 5,
        max_delay_ms: 50,
        step_down_ms: 1,
        step_up_ms: 10,
        response_timeout_ms: 50,
        stall_window_ms: 200,
        recover_cycles: 2,
        stale_combined_ms: 200,
        stale_per_pid_ms: 400,
        probe_rounds: 3,
        probe_round_delay_ms: 5,
        ..PollingConfig::default()
    }
}

/// Poll `cond` until it holds or five seconds pass
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Writes go to a [`SimulatedAdapter`], its answer is delivered to the
/// session listener before `write` returns.
#[derive(Clone)]
pub struct SimWire {
    pub shared: Arc<SessionShared>,
    adapter: Arc<Mutex<SimulatedAdapter>>,
    sent: Arc<Mutex<Vec<String>>>,
    /// Record writes without answering
    manual: Arc<AtomicBool>,
    fail_after: Arc<AtomicUsize>,
}

impl SimWire {
    pub fn new(vehicle: VehicleState) -> Self {
        Self {
            shared: SessionShared::new(&fast_session_config(), status()),
            adapter: Arc::new(Mutex::new(SimulatedAdapter::new(vehicle))),
            sent: Arc::default(),
            manual: Arc::default(),
            fail_after: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    pub fn adapter(&self) -> MutexGuard<'_, SimulatedAdapter> {
        self.adapter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::Relaxed);
    }

    /// Fail every write after the first `n`
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::Relaxed);
    }
}

impl LinkWriter for SimWire {
    fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        {
            let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
            if sent.len() >= self.fail_after.load(Ordering::Relaxed) {
                return Err(LinkError::Transport { code: -1 });
            }
            sent.push(String::from_utf8_lossy(data).into_owned());
        }
        if self.manual.load(Ordering::Relaxed) {
            return Ok(());
        }
        let reply = self.adapter().feed(data);
        self.shared.on_bytes(&reply);
        Ok(())
    }
}
