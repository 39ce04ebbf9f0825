//! Status surface for collaborators (relay/LED control, HTTP status)
//!
//! Written by the session engine and the scheduler, read from anywhere.
//! Every item is its own atomic, so readers never block the data path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use nitrotalk_elm327_lib::{Gear, Telemetry, TelemetryValues};
use nitrotalk_link_lib::{AtomicConnectionState, ConnectionState};
use serde::Serialize;

use crate::health::{AtomicEcuState, EcuState};
use crate::polling::{AtomicPollMode, PollMode};
use crate::session::{AtomicSessionState, SessionState};

pub struct Status {
    connection: Arc<AtomicConnectionState>,
    session: AtomicSessionState,
    ecu: AtomicEcuState,
    ecu_unreachable: AtomicBool,
    ecu_losses: AtomicU32,
    poll_mode: AtomicPollMode,
    poll_delay_ms: AtomicU32,
    adapter_millivolts: AtomicU32,
    rpm: AtomicU32,
    throttle_pct: AtomicU8,
    speed_kmh: AtomicU8,
    /// Owned by the injection controller; only reported here
    auto_injection: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub transport_connected: bool,
    pub ecu_connected: bool,
    pub ecu_unreachable: bool,
    pub connection: ConnectionState,
    pub session: SessionState,
    pub ecu: EcuState,
    pub ecu_losses: u32,
    pub poll_mode: PollMode,
    pub poll_delay_ms: u32,
    pub adapter_millivolts: u32,
    pub auto_injection: bool,
    pub telemetry: TelemetryValues,
    /// Estimated from speed
    pub gear: Gear,
}

impl Status {
    /// `connection` is the same atomic the connection manager mirrors its
    /// state into.
    pub fn new(connection: Arc<AtomicConnectionState>) -> Self {
        Self {
            connection,
            session: AtomicSessionState::new(SessionState::Uninitialized),
            ecu: AtomicEcuState::new(EcuState::Unverified),
            ecu_unreachable: AtomicBool::new(false),
            ecu_losses: AtomicU32::new(0),
            poll_mode: AtomicPollMode::new(PollMode::Combined),
            poll_delay_ms: AtomicU32::new(0),
            adapter_millivolts: AtomicU32::new(0),
            rpm: AtomicU32::new(0),
            throttle_pct: AtomicU8::new(0),
            speed_kmh: AtomicU8::new(0),
            auto_injection: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection.load(Ordering::Relaxed)
    }

    pub fn transport_connected(&self) -> bool {
        self.connection() == ConnectionState::Ready
    }

    pub fn session(&self) -> SessionState {
        self.session.load(Ordering::Relaxed)
    }

    pub(crate) fn set_session(&self, state: SessionState) {
        self.session.store(state, Ordering::Relaxed);
    }

    pub fn ecu(&self) -> EcuState {
        self.ecu.load(Ordering::Relaxed)
    }

    pub fn ecu_connected(&self) -> bool {
        self.ecu() == EcuState::Connected
    }

    pub(crate) fn set_ecu(&self, state: EcuState) {
        self.ecu.store(state, Ordering::Relaxed);
    }

    pub fn ecu_unreachable(&self) -> bool {
        self.ecu_unreachable.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ecu_unreachable(&self, unreachable: bool) {
        self.ecu_unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub(crate) fn record_ecu_loss(&self) {
        self.ecu_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_polling(&self, mode: PollMode, delay_ms: u32) {
        self.poll_mode.store(mode, Ordering::Relaxed);
        self.poll_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn adapter_millivolts(&self) -> u32 {
        self.adapter_millivolts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_adapter_millivolts(&self, millivolts: u32) {
        self.adapter_millivolts.store(millivolts, Ordering::Relaxed);
    }

    pub(crate) fn publish_telemetry(&self, telemetry: &Telemetry) {
        let values = telemetry.values();
        self.rpm.store(values.rpm, Ordering::Relaxed);
        self.throttle_pct.store(values.throttle_pct, Ordering::Relaxed);
        self.speed_kmh.store(values.speed_kmh, Ordering::Relaxed);
    }

    pub fn telemetry(&self) -> TelemetryValues {
        TelemetryValues {
            rpm: self.rpm.load(Ordering::Relaxed),
            throttle_pct: self.throttle_pct.load(Ordering::Relaxed),
            speed_kmh: self.speed_kmh.load(Ordering::Relaxed),
        }
    }

    pub fn auto_injection(&self) -> bool {
        self.auto_injection.load(Ordering::Relaxed)
    }

    pub fn set_auto_injection(&self, enabled: bool) {
        self.auto_injection.store(enabled, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let connection = self.connection();
        let ecu = self.ecu();
        let telemetry = self.telemetry();
        StatusSnapshot {
            transport_connected: connection == ConnectionState::Ready,
            ecu_connected: ecu == EcuState::Connected,
            ecu_unreachable: self.ecu_unreachable(),
            connection,
            session: self.session(),
            ecu,
            ecu_losses: self.ecu_losses.load(Ordering::Relaxed),
            poll_mode: self.poll_mode.load(Ordering::Relaxed),
            poll_delay_ms: self.poll_delay_ms.load(Ordering::Relaxed),
            adapter_millivolts: self.adapter_millivolts(),
            auto_injection: self.auto_injection(),
            telemetry,
            gear: telemetry.gear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nitrotalk_elm327_lib::decode_mode01;
    use std::time::Instant;

    #[test]
    fn test_snapshot_json() {
        let connection = Arc::new(AtomicConnectionState::new(ConnectionState::Scanning));
        let status = Status::new(connection.clone());
        let mut telemetry = Telemetry::default();
        telemetry.apply(&decode_mode01("41 0C 2E E0 41 0D 3C 41 11 FF"), Instant::now());
        status.publish_telemetry(&telemetry);
        status.set_adapter_millivolts(12_400);

        let snapshot = status.snapshot();
        assert!(!snapshot.transport_connected);
        assert_eq!(snapshot.telemetry.rpm, 3000);

        connection.store(ConnectionState::Ready, Ordering::Relaxed);
        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["transport_connected"], true);
        assert_eq!(json["connection"], "Ready");
        assert_eq!(json["ecu"], "Unverified");
        assert_eq!(json["adapter_millivolts"], 12_400);
        assert_eq!(json["telemetry"]["speed_kmh"], 60);
        assert_eq!(json["telemetry"]["throttle_pct"], 100);
        assert_eq!(json["gear"], "4");

        status.publish_telemetry(&Telemetry::default());
        assert_eq!(status.snapshot().gear, Gear::Neutral);
    }
}
