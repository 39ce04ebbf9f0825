//! ECU Health Monitor
//!
//! ECU state is separate from the Bluetooth link: the adapter can be up and
//! answering while the vehicle bus stays silent. Only the polling controller's
//! ceiling-failure verdict, or a failed probe, moves the state away from
//! `Connected`.

use std::sync::Arc;

use atomic_enum::atomic_enum;
use log::{error, info, warn};
use nitrotalk_elm327_lib::AdapterError;
use serde::Serialize;

use crate::status::Status;

#[atomic_enum]
#[derive(PartialEq, Eq, Serialize)]
pub enum EcuState {
    Unverified = 0,
    Verifying,
    Connected,
    Lost,
}

/// Adapter-reported error tokens, per kind
///
/// Diagnostic only. A decoded response resets the consecutive count and
/// decays every per-kind count by one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterErrorCounts {
    pub no_data: u32,
    pub can_error: u32,
    pub unable_to_connect: u32,
    pub other: u32,
    pub consecutive: u32,
}

impl AdapterErrorCounts {
    pub fn record(&mut self, kind: AdapterError) {
        let slot = match kind {
            AdapterError::NoData => &mut self.no_data,
            AdapterError::CanError => &mut self.can_error,
            AdapterError::UnableToConnect => &mut self.unable_to_connect,
            _ => &mut self.other,
        };
        *slot = slot.saturating_add(1);
        self.consecutive = self.consecutive.saturating_add(1);
    }

    pub fn decay(&mut self) {
        self.consecutive = 0;
        for count in [
            &mut self.no_data,
            &mut self.can_error,
            &mut self.unable_to_connect,
            &mut self.other,
        ] {
            *count = count.saturating_sub(1);
        }
    }

    pub fn total(&self) -> u32 {
        self.no_data + self.can_error + self.unable_to_connect + self.other
    }
}

pub struct HealthMonitor {
    status: Arc<Status>,
    failed_rounds: u32,
    max_rounds: u32,
}

impl HealthMonitor {
    pub fn new(status: Arc<Status>, max_rounds: u32) -> Self {
        Self {
            status,
            failed_rounds: 0,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn state(&self) -> EcuState {
        self.status.ecu()
    }

    pub fn failed_rounds(&self) -> u32 {
        self.failed_rounds
    }

    /// Fresh adapter session: forget all earlier verdicts
    pub fn reset(&mut self) {
        self.failed_rounds = 0;
        self.status.set_ecu_unreachable(false);
        self.status.set_ecu(EcuState::Unverified);
    }

    pub fn begin_probe(&mut self) {
        info!("🔎 Verifying ECU connectivity (round {})", self.failed_rounds + 1);
        self.status.set_ecu(EcuState::Verifying);
    }

    pub fn probe_succeeded(&mut self) {
        info!("✅ ECU connected");
        self.failed_rounds = 0;
        self.status.set_ecu_unreachable(false);
        self.status.set_ecu(EcuState::Connected);
    }

    /// Record a failed probe round. Returns true once the round budget is
    /// spent and the ECU has been reported unreachable.
    pub fn probe_failed(&mut self) -> bool {
        self.failed_rounds += 1;
        self.status.set_ecu(EcuState::Unverified);
        if self.failed_rounds >= self.max_rounds {
            error!(
                "❌ ECU did not answer after {} probe rounds, check ignition and wiring",
                self.failed_rounds
            );
            self.status.set_ecu_unreachable(true);
            true
        } else {
            warn!(
                "ECU not responding (round {}/{})",
                self.failed_rounds, self.max_rounds
            );
            false
        }
    }

    pub fn declare_lost(&mut self) {
        warn!("🔴 ECU lost, re-verifying without dropping the link");
        self.failed_rounds = 0;
        self.status.record_ecu_loss();
        self.status.set_ecu(EcuState::Lost);
    }
}
