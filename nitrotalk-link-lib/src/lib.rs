//! Bluetooth link management for ELM327 adapters
//!
//! Two connection managers share one abstract state machine: [`gatt`] drives
//! a BLE central through scan, connect, service/characteristic discovery and
//! notification enablement; [`spp`] drives Classic inquiry and an RFCOMM
//! channel open. Both are pure state machines over a transport trait and a
//! transport event enum, so the platform glue only translates callbacks into
//! events and the logic runs (and is tested) on the host.
//!
//! The [`task`] module owns one manager on a thread, the [`supervisor`]
//! watches it for wedged or idle states.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use atomic_enum::atomic_enum;
use derive_more::{Display, Error};
use log::debug;
use serde::Serialize;

pub mod backoff;
pub mod config;
pub mod gatt;
pub mod spp;
pub mod supervisor;
pub mod task;
pub mod types;

#[cfg(test)]
mod testing;

pub use backoff::{FailureBackoff, FailureSignature};
pub use config::{LinkConfig, NotifyStrategy};
pub use gatt::{GattConnectionManager, GattEvent, GattTransport};
pub use spp::{SppConnectionManager, SppEvent, SppTransport};
pub use supervisor::Supervisor;
pub use task::{LinkHandle, LinkMessage, LinkSender, LinkTask};
pub use types::{AddrType, BdAddr, BtUuid, CharProperty, Characteristic, ConnId, ServiceRange};

/// Connection State, one instance per process
#[atomic_enum]
#[derive(PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle = 0,
    Scanning,
    /// Target seen, waiting for the scan to stop before connecting
    Pending,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    EnablingNotifications,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// States from which discovery may be (re)started
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// A connection attempt is in flight but the link is not usable yet
    pub const fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::EnablingNotifications
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum LinkError {
    #[display("link is not ready")]
    NotReady,
    #[display("no write endpoint was discovered")]
    NoWriteEndpoint,
    #[display("transport error {code}")]
    Transport { code: i32 },
    #[display("link request timed out")]
    Timeout,
    #[display("link task is gone")]
    TaskGone,
}

/// Receiver of link-level happenings, implemented by the session engine
///
/// Called from the link task's thread; implementations must not block.
pub trait LinkListener: Send + Sync {
    /// The link reached `Ready`. `writable` is false in receive-only mode.
    fn on_link_ready(&self, writable: bool);
    /// Raw bytes from the adapter
    fn on_bytes(&self, data: &[u8]);
    fn on_link_lost(&self);
}

/// Anything that can carry a command to the adapter
pub trait LinkWriter: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), LinkError>;
}

/// The operations the link task and the supervisor need from a
/// connection manager.
pub trait Link {
    type Event: Send + 'static;

    fn handle_event(&mut self, event: Self::Event, now: Instant);
    /// Advance timers (deferred rescans, notification toggle wait)
    fn poll(&mut self, now: Instant);
    fn state(&self) -> ConnectionState;
    /// When the current state was entered
    fn state_since(&self) -> Instant;
    fn start_discovery(&mut self, now: Instant);
    fn stop_scan(&mut self, now: Instant);
    /// Close the link on request. Not recorded as a failure.
    fn disconnect(&mut self, now: Instant);
    /// Drop every handle and all discovery state, then start over from `Idle`
    fn hard_reset(&mut self, now: Instant);
    fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;
}

/// Connection State plus when it was entered, mirrored into a shared atomic
/// for status readers.
pub(crate) struct StateTracker {
    state: ConnectionState,
    since: Instant,
    shared: Arc<AtomicConnectionState>,
}

impl StateTracker {
    pub(crate) fn new(shared: Arc<AtomicConnectionState>, now: Instant) -> Self {
        shared.store(ConnectionState::Idle, Ordering::Relaxed);
        Self {
            state: ConnectionState::Idle,
            since: now,
            shared,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn since(&self) -> Instant {
        self.since
    }

    pub(crate) fn set(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            debug!("🔗 Connection state: {:?} -> {state:?}", self.state);
            self.state = state;
            self.since = now;
            self.shared.store(state, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracker_mirrors_shared() {
        let shared = Arc::new(AtomicConnectionState::new(ConnectionState::Ready));
        let t0 = Instant::now();
        let mut tracker = StateTracker::new(shared.clone(), t0);
        assert_eq!(shared.load(Ordering::Relaxed), ConnectionState::Idle);

        let t1 = t0 + std::time::Duration::from_millis(5);
        tracker.set(ConnectionState::Scanning, t1);
        assert_eq!(shared.load(Ordering::Relaxed), ConnectionState::Scanning);
        assert_eq!(tracker.since(), t1);

        // Re-entering the same state keeps the original timestamp
        tracker.set(ConnectionState::Scanning, t1 + std::time::Duration::from_millis(5));
        assert_eq!(tracker.since(), t1);
    }

    #[test]
    fn test_state_classes() {
        assert!(ConnectionState::Disconnected.is_idle());
        assert!(!ConnectionState::Scanning.is_idle());
        assert!(ConnectionState::Pending.is_establishing());
        assert!(ConnectionState::EnablingNotifications.is_establishing());
        assert!(!ConnectionState::Ready.is_establishing());
    }

    #[test]
    fn test_state_copy_debug_and_json() {
        let state = ConnectionState::EnablingNotifications;
        let copy = state;
        assert_eq!(copy, state);
        assert_eq!(format!("{state:?}"), "EnablingNotifications");
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"EnablingNotifications\"");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(LinkError::Transport { code: -3 }.to_string(), "transport error -3");
        assert_eq!(LinkError::NotReady.to_string(), "link is not ready");
    }
}
