//! Classic Bluetooth SPP (RFCOMM) connection manager
//!
//! The Classic variant has no service discovery: inquiry, match the target
//! address, cancel the inquiry, open an RFCOMM channel. The primary channel is
//! tried first, then the fallback channel, then the whole sequence starts over
//! through the backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backoff::{FailureBackoff, FailureSignature};
use crate::config::LinkConfig;
use crate::types::BdAddr;
use crate::{AtomicConnectionState, ConnectionState, Link, LinkError, LinkListener, StateTracker};

pub trait SppTransport {
    fn start_inquiry(&mut self, duration: Duration) -> Result<(), LinkError>;
    fn cancel_inquiry(&mut self) -> Result<(), LinkError>;
    fn connect(&mut self, addr: BdAddr, channel: u8) -> Result<(), LinkError>;
    fn disconnect(&mut self, handle: u32) -> Result<(), LinkError>;
    fn write(&mut self, handle: u32, data: &[u8]) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SppEvent {
    InquiryStarted { ok: bool },
    DeviceFound { addr: BdAddr },
    /// Inquiry cancelled or its duration elapsed
    InquiryStopped,
    Opened { handle: u32 },
    OpenFailed { status: i32 },
    Data { handle: u32, data: Vec<u8> },
    WriteFailed { status: i32 },
    Closed { handle: u32, reason: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SppLink {
    Closed,
    Opening { channel: u8 },
    Open(u32),
}

pub struct SppConnectionManager<T: SppTransport> {
    transport: T,
    config: LinkConfig,
    listener: Arc<dyn LinkListener>,
    state: StateTracker,
    link: SppLink,
    backoff: FailureBackoff,
    rescan_at: Option<Instant>,
}

impl<T: SppTransport> SppConnectionManager<T> {
    pub fn new(
        transport: T,
        config: LinkConfig,
        listener: Arc<dyn LinkListener>,
        shared_state: Arc<AtomicConnectionState>,
        now: Instant,
    ) -> Self {
        let backoff = FailureBackoff::new(
            Duration::from_millis(config.failure_window_ms),
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        Self {
            transport,
            config,
            listener,
            state: StateTracker::new(shared_state, now),
            link: SppLink::Closed,
            backoff,
            rescan_at: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn target(&self) -> BdAddr {
        self.config.target
    }

    fn close_link(&mut self) {
        if let SppLink::Open(handle) = self.link {
            if let Err(e) = self.transport.disconnect(handle) {
                warn!("Failed to close SPP link: {e}");
            }
        }
        self.link = SppLink::Closed;
    }

    fn teardown(&mut self, now: Instant) {
        self.link = SppLink::Closed;
        self.state.set(ConnectionState::Disconnected, now);
        self.listener.on_link_lost();
    }

    fn fail(&mut self, signature: FailureSignature, now: Instant) {
        let delay = self.backoff.record(signature, now);
        self.teardown(now);
        self.rescan_at = Some(now + delay);
        if delay.is_zero() {
            self.start_discovery(now);
        }
    }

    fn open_channel(&mut self, channel: u8, now: Instant) {
        let target = self.target();
        info!("🔌 Opening RFCOMM channel {channel} to {target}");
        self.link = SppLink::Opening { channel };
        self.state.set(ConnectionState::Connecting, now);
        if let Err(e) = self.transport.connect(target, channel) {
            warn!("❌ SPP connect request failed: {e}");
            let status = match e {
                LinkError::Transport { code } => code,
                _ => -1,
            };
            self.on_open_failed(status, now);
        }
    }

    fn on_open_failed(&mut self, status: i32, now: Instant) {
        let SppLink::Opening { channel } = self.link else {
            return;
        };
        let fallback = self.config.rfcomm_fallback_channel;
        if channel != fallback {
            warn!("RFCOMM channel {channel} failed (status {status}), trying channel {fallback}");
            self.open_channel(fallback, now);
        } else {
            warn!("❌ RFCOMM connection to {} failed (status {status})", self.target());
            self.link = SppLink::Closed;
            self.fail(FailureSignature::ConnectFailed { status }, now);
        }
    }
}

impl<T: SppTransport> Link for SppConnectionManager<T> {
    type Event = SppEvent;

    fn handle_event(&mut self, event: SppEvent, now: Instant) {
        match event {
            SppEvent::InquiryStarted { ok } => {
                if !ok && self.state.get() == ConnectionState::Scanning {
                    warn!("❌ Inquiry failed to start");
                    self.state.set(ConnectionState::Idle, now);
                    self.rescan_at = Some(now + self.config.rescan_delay());
                }
            }
            SppEvent::DeviceFound { addr } => {
                if addr != self.target() {
                    return;
                }
                if self.state.get() != ConnectionState::Scanning || self.link != SppLink::Closed {
                    debug!("Ignoring inquiry result from {addr}, attempt already in flight");
                    return;
                }
                info!("🎯 Found target {addr}, cancelling inquiry");
                self.state.set(ConnectionState::Pending, now);
                if let Err(e) = self.transport.cancel_inquiry() {
                    warn!("Failed to cancel inquiry: {e}");
                    self.state.set(ConnectionState::Idle, now);
                    self.rescan_at = Some(now + self.config.rescan_delay());
                }
            }
            SppEvent::InquiryStopped => match self.state.get() {
                ConnectionState::Pending => {
                    self.open_channel(self.config.rfcomm_primary_channel, now);
                }
                ConnectionState::Scanning => {
                    info!("Inquiry ended without finding {}", self.target());
                    self.state.set(ConnectionState::Idle, now);
                    self.rescan_at = Some(now + self.config.rescan_delay());
                }
                state => debug!("Inquiry stopped in state {state:?}"),
            },
            SppEvent::Opened { handle } => {
                if !matches!(self.link, SppLink::Opening { .. }) {
                    warn!("Unexpected SPP connection {handle}, closing it");
                    if let Err(e) = self.transport.disconnect(handle) {
                        warn!("Failed to close unexpected connection: {e}");
                    }
                    return;
                }
                self.link = SppLink::Open(handle);
                self.state.set(ConnectionState::Ready, now);
                info!("✅ SPP link ready to {} (handle {handle})", self.target());
                self.listener.on_link_ready(true);
            }
            SppEvent::OpenFailed { status } => self.on_open_failed(status, now),
            SppEvent::Data { handle, data } => {
                if self.link == SppLink::Open(handle) {
                    debug!("⬇️ {} bytes: {:?}", data.len(), String::from_utf8_lossy(&data));
                    self.listener.on_bytes(&data);
                }
            }
            SppEvent::WriteFailed { status } => warn!("❌ SPP write failed (status {status})"),
            SppEvent::Closed { handle, reason } => {
                if self.link != SppLink::Open(handle) {
                    debug!("Ignoring close of stale SPP handle {handle}");
                    return;
                }
                warn!("🔴 SPP link to {} closed (reason {reason})", self.target());
                self.link = SppLink::Closed;
                self.fail(FailureSignature::Disconnected { reason }, now);
            }
        }
    }

    fn poll(&mut self, now: Instant) {
        if self.rescan_at.is_some_and(|at| now >= at) && self.state.get().is_idle() {
            self.start_discovery(now);
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn state_since(&self) -> Instant {
        self.state.since()
    }

    fn start_discovery(&mut self, now: Instant) {
        let state = self.state.get();
        if !state.is_idle() {
            debug!("Inquiry not started, state is {state:?}");
            return;
        }
        if self.rescan_at.is_some_and(|at| at > now) {
            return;
        }
        self.rescan_at = None;
        info!("🔍 Inquiry for {} ({}s)", self.target(), self.config.scan_duration_secs);
        match self.transport.start_inquiry(self.config.scan_duration()) {
            Ok(()) => self.state.set(ConnectionState::Scanning, now),
            Err(e) => {
                warn!("❌ Failed to start inquiry: {e}");
                self.rescan_at = Some(now + self.config.rescan_delay());
            }
        }
    }

    fn stop_scan(&mut self, now: Instant) {
        if self.state.get() != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = self.transport.cancel_inquiry() {
            warn!("Failed to cancel inquiry: {e}");
            self.state.set(ConnectionState::Idle, now);
            self.rescan_at = Some(now + self.config.rescan_delay());
        }
    }

    fn disconnect(&mut self, now: Instant) {
        let state = self.state.get();
        if state.is_idle() && self.link == SppLink::Closed {
            return;
        }
        info!("Disconnecting SPP link (state {state:?})");
        if matches!(state, ConnectionState::Scanning | ConnectionState::Pending) {
            if let Err(e) = self.transport.cancel_inquiry() {
                debug!("Failed to cancel inquiry: {e}");
            }
        }
        self.close_link();
        self.teardown(now);
        self.rescan_at = Some(now);
    }

    fn hard_reset(&mut self, now: Instant) {
        warn!("♻️ Hard reset of SPP connection state");
        if matches!(
            self.state.get(),
            ConnectionState::Scanning | ConnectionState::Pending
        ) {
            if let Err(e) = self.transport.cancel_inquiry() {
                debug!("Failed to cancel inquiry: {e}");
            }
        }
        self.close_link();
        self.backoff.reset();
        self.teardown(now);
        self.state.set(ConnectionState::Idle, now);
        self.rescan_at = None;
        self.start_discovery(now);
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        match self.link {
            SppLink::Open(handle) if self.state.get() == ConnectionState::Ready => {
                self.transport.write(handle, data)
            }
            _ => Err(LinkError::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Heard, RecordingListener, RecordingTransport};

    fn manager() -> (
        SppConnectionManager<RecordingTransport>,
        Arc<RecordingListener>,
        Instant,
    ) {
        let listener = Arc::new(RecordingListener::default());
        let now = Instant::now();
        let config = LinkConfig {
            target: BdAddr([0x01, 0x23, 0x45, 0x67, 0x89, 0xBA]),
            ..LinkConfig::default()
        };
        let shared = Arc::new(AtomicConnectionState::new(ConnectionState::Idle));
        let m = SppConnectionManager::new(
            RecordingTransport::default(),
            config,
            listener.clone(),
            shared,
            now,
        );
        (m, listener, now)
    }

    fn found(m: &mut SppConnectionManager<RecordingTransport>, now: Instant) {
        let addr = m.target();
        m.handle_event(SppEvent::DeviceFound { addr }, now);
    }

    #[test]
    fn test_connect_after_inquiry_cancelled() {
        let (mut m, listener, now) = manager();
        m.start_discovery(now);
        assert_eq!(m.state(), ConnectionState::Scanning);
        found(&mut m, now);
        found(&mut m, now);
        assert_eq!(m.transport().count(&Call::CancelInquiry), 1);
        assert!(!m.transport().calls.iter().any(|c| matches!(c, Call::Connect(..))));

        m.handle_event(SppEvent::InquiryStopped, now);
        assert_eq!(m.transport().calls.last(), Some(&Call::Connect(m.target(), 2)));
        m.handle_event(SppEvent::Opened { handle: 0x81 }, now);
        assert_eq!(m.state(), ConnectionState::Ready);
        assert_eq!(listener.heard(), vec![Heard::Ready { writable: true }]);

        assert_eq!(m.write(b"ATZ\r"), Ok(()));
        assert_eq!(m.transport().calls.last(), Some(&Call::Write(0x81, b"ATZ\r".to_vec())));
    }

    #[test]
    fn test_fallback_channel_then_rescan() {
        let (mut m, _, now) = manager();
        m.start_discovery(now);
        found(&mut m, now);
        m.handle_event(SppEvent::InquiryStopped, now);
        m.handle_event(SppEvent::OpenFailed { status: 1 }, now);
        assert_eq!(m.transport().calls.last(), Some(&Call::Connect(m.target(), 1)));
        assert_eq!(m.state(), ConnectionState::Connecting);

        m.handle_event(SppEvent::OpenFailed { status: 1 }, now);
        // Both channels failed: the inquiry starts over
        assert_eq!(m.state(), ConnectionState::Scanning);
        assert_eq!(m.transport().count(&Call::StartInquiry), 2);
    }

    #[test]
    fn test_data_forwarded_and_close_handled() {
        let (mut m, listener, now) = manager();
        m.start_discovery(now);
        found(&mut m, now);
        m.handle_event(SppEvent::InquiryStopped, now);
        m.handle_event(SppEvent::Opened { handle: 7 }, now);
        m.handle_event(
            SppEvent::Data {
                handle: 7,
                data: b"41 0D 3C\r".to_vec(),
            },
            now,
        );
        m.handle_event(SppEvent::Closed { handle: 7, reason: 0 }, now);
        assert_eq!(
            listener.heard(),
            vec![
                Heard::Ready { writable: true },
                Heard::Bytes(b"41 0D 3C\r".to_vec()),
                Heard::Lost
            ]
        );
        assert_eq!(m.write(b"0100\r"), Err(LinkError::NotReady));
        m.handle_event(SppEvent::Closed { handle: 7, reason: 0 }, now);
        assert_eq!(listener.heard().len(), 3);
    }

    #[test]
    fn test_fruitless_inquiry_waits_before_rescan() {
        let (mut m, _, now) = manager();
        m.start_discovery(now);
        m.handle_event(SppEvent::InquiryStopped, now);
        assert_eq!(m.state(), ConnectionState::Idle);
        m.poll(now + Duration::from_secs(4));
        assert_eq!(m.state(), ConnectionState::Idle);
        m.poll(now + Duration::from_secs(5));
        assert_eq!(m.state(), ConnectionState::Scanning);
    }
}
