//! BLE GATT central connection manager
//!
//! Drives one target adapter from scan to a subscribed UART-style service.
//! The platform callbacks are delivered as [`GattEvent`]s; every request goes
//! out through [`GattTransport`], whose methods only issue requests and never
//! wait for their completion.
//!
//! Scan and connect never overlap: a matching advertisement only records the
//! candidate and stops the scan, the connect request goes out once the
//! scan-stopped confirmation arrives. Some adapters (and the ESP32 controller)
//! silently drop connect requests issued while scanning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backoff::{FailureBackoff, FailureSignature};
use crate::config::LinkConfig;
use crate::types::{AddrType, BdAddr, BtUuid, CharProperty, Characteristic, ConnId, ServiceRange};
use crate::{AtomicConnectionState, ConnectionState, Link, LinkError, LinkListener, StateTracker};

/// Client characteristic configuration descriptor
pub const CCCD_UUID: BtUuid = BtUuid::U16(0x2902);
pub const NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];
pub const NOTIFY_DISABLE: [u8; 2] = [0x00, 0x00];

/// Default ATT MTU before negotiation
const DEFAULT_MTU: u16 = 23;

/// Known UART bridge services: the vendor service of the Veepeak-class
/// adapters, then the two common 16-bit serial services.
pub const UART_SERVICES: [BtUuid; 3] = [
    BtUuid::U128([
        0x21, 0x9E, 0xCA, 0xDC, 0x24, 0x0E, 0x5E, 0xE5, 0xA9, 0xE0, 0x93, 0xF3, 0xA3, 0xB5, 0x01, 0x6E,
    ]),
    BtUuid::U16(0xFFF0),
    BtUuid::U16(0xFFE0),
];

/// (write, notify) UUID pairs, in preference order
pub const UART_CHARACTERISTIC_PAIRS: [(BtUuid, BtUuid); 3] = [
    (
        BtUuid::from_u128(0x6E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E),
        BtUuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E),
    ),
    (BtUuid::U16(0xFFF2), BtUuid::U16(0xFFF1)),
    (BtUuid::U16(0xFFE1), BtUuid::U16(0xFFE1)),
];

pub fn is_uart_service(uuid: &BtUuid) -> bool {
    UART_SERVICES.iter().any(|known| known.matches(uuid))
}

/// Requests the manager issues. Completion is reported back as a [`GattEvent`]
/// unless the method returns the answer directly.
pub trait GattTransport {
    fn start_scan(&mut self, duration: Duration) -> Result<(), LinkError>;
    fn stop_scan(&mut self) -> Result<(), LinkError>;
    fn open(&mut self, addr: BdAddr, addr_type: AddrType) -> Result<(), LinkError>;
    /// Close an open connection, or cancel a pending open when `conn` is `None`
    fn close(&mut self, conn: Option<ConnId>) -> Result<(), LinkError>;
    fn request_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<(), LinkError>;
    fn search_services(&mut self, conn: ConnId) -> Result<(), LinkError>;
    /// Characteristics of a service, from the attribute cache filled by the search
    fn characteristics(
        &mut self,
        conn: ConnId,
        range: ServiceRange,
    ) -> Result<Vec<Characteristic>, LinkError>;
    /// Handle of a descriptor of the given characteristic, if the cache has it
    fn descriptor(&mut self, conn: ConnId, char_handle: u16, uuid: BtUuid) -> Option<u16>;
    fn register_for_notify(&mut self, addr: BdAddr, handle: u16) -> Result<(), LinkError>;
    fn write_descriptor(&mut self, conn: ConnId, handle: u16, value: &[u8]) -> Result<(), LinkError>;
    fn write_characteristic(
        &mut self,
        conn: ConnId,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError>;
}

/// Platform callbacks, translated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ScanStarted { ok: bool },
    ScanResult { addr: BdAddr, addr_type: AddrType, rssi: i8 },
    /// The scan ended, either on request or because its duration elapsed
    ScanStopped,
    Connected { conn: ConnId, addr: BdAddr },
    ConnectFailed { status: i32 },
    MtuConfigured { mtu: u16, ok: bool },
    ServiceFound { uuid: BtUuid, range: ServiceRange },
    ServiceSearchComplete { ok: bool },
    NotifyRegistered { handle: u16, ok: bool },
    DescriptorWritten { handle: u16, ok: bool },
    CharacteristicWritten { handle: u16, ok: bool },
    Notification { handle: u16, data: Vec<u8> },
    Disconnected { conn: ConnId, reason: i32 },
}

/// Transport Link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportLink {
    Closed,
    Opening,
    Open(ConnId),
}

/// Discovered endpoints; all unset until discovery completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicMap {
    pub write: Option<Characteristic>,
    pub notify: Option<Characteristic>,
    pub cccd: Option<u16>,
}

impl CharacteristicMap {
    fn offer(&mut self, c: &Characteristic) {
        if self.notify.is_none() && c.can_notify() {
            self.notify = Some(*c);
        }
        if self.write.is_none() && c.can_write() {
            self.write = Some(*c);
        }
    }
}

/// Pick write and notify endpoints by capability bits
///
/// Known UUID pairs are walked in preference order; within them, the first
/// characteristic advertising notify becomes the notify endpoint and the first
/// advertising either write flavour becomes the write endpoint, regardless of
/// which side of the pair its UUID is on. Characteristics with unknown UUIDs
/// are only considered when the known pairs leave a gap.
pub fn select_endpoints(chars: &[Characteristic]) -> CharacteristicMap {
    let mut map = CharacteristicMap::default();
    for (write_uuid, notify_uuid) in &UART_CHARACTERISTIC_PAIRS {
        for c in chars
            .iter()
            .filter(|c| c.uuid.matches(write_uuid) || c.uuid.matches(notify_uuid))
        {
            map.offer(c);
        }
    }
    if map.notify.is_none() || map.write.is_none() {
        for c in chars {
            map.offer(c);
        }
    }
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyStep {
    Registering,
    Enabling,
    Disabling,
    Waiting { until: Instant },
    ReEnabling,
}

pub struct GattConnectionManager<T: GattTransport> {
    transport: T,
    config: LinkConfig,
    listener: Arc<dyn LinkListener>,
    state: StateTracker,
    link: TransportLink,
    /// Address type from the matching advertisement, consumed by the connect
    candidate: Option<AddrType>,
    service: Option<ServiceRange>,
    chars: CharacteristicMap,
    notify_step: Option<NotifyStep>,
    mtu: u16,
    backoff: FailureBackoff,
    rescan_at: Option<Instant>,
}

impl<T: GattTransport> GattConnectionManager<T> {
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
            link: TransportLink::Closed,
            candidate: None,
            service: None,
            chars: CharacteristicMap::default(),
            notify_step: None,
            mtu: DEFAULT_MTU,
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

    pub fn characteristics(&self) -> &CharacteristicMap {
        &self.chars
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    fn target(&self) -> BdAddr {
        self.config.target
    }

    fn conn(&self) -> Option<ConnId> {
        match self.link {
            TransportLink::Open(conn) => Some(conn),
            _ => None,
        }
    }

    fn schedule_rescan(&mut self, at: Instant) {
        self.rescan_at = Some(at);
    }

    /// Close whatever the transport has open or pending
    fn close_link(&mut self) {
        let result = match self.link {
            TransportLink::Open(conn) => self.transport.close(Some(conn)),
            TransportLink::Opening => self.transport.close(None),
            TransportLink::Closed => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to close link: {e}");
        }
        self.link = TransportLink::Closed;
    }

    /// Forget every handle and report the link lost
    fn teardown(&mut self, now: Instant) {
        self.link = TransportLink::Closed;
        self.candidate = None;
        self.service = None;
        self.chars = CharacteristicMap::default();
        self.notify_step = None;
        self.mtu = DEFAULT_MTU;
        self.state.set(ConnectionState::Disconnected, now);
        self.listener.on_link_lost();
    }

    /// Record a failure, tear down, and go back to scanning (after the
    /// backoff delay if this failure keeps repeating)
    fn fail(&mut self, signature: FailureSignature, now: Instant) {
        let delay = self.backoff.record(signature, now);
        self.teardown(now);
        self.schedule_rescan(now + delay);
        if delay.is_zero() {
            self.start_discovery(now);
        }
    }

    /// Close the link, then [`Self::fail`]
    fn abort(&mut self, signature: FailureSignature, now: Instant) {
        self.close_link();
        self.fail(signature, now);
    }

    fn on_scan_result(&mut self, addr: BdAddr, addr_type: AddrType, rssi: i8, now: Instant) {
        if addr != self.target() {
            return;
        }
        if self.state.get() != ConnectionState::Scanning
            || self.link != TransportLink::Closed
            || self.candidate.is_some()
        {
            debug!("Ignoring advertisement from {addr}, attempt already in flight");
            return;
        }
        info!("🎯 Found target {addr} (RSSI {rssi}), stopping scan before connecting");
        self.candidate = Some(addr_type);
        self.state.set(ConnectionState::Pending, now);
        if let Err(e) = self.transport.stop_scan() {
            warn!("Failed to stop scan: {e}, retrying discovery later");
            self.candidate = None;
            self.state.set(ConnectionState::Idle, now);
            self.schedule_rescan(now + self.config.rescan_delay());
        }
    }

    fn on_scan_stopped(&mut self, now: Instant) {
        match self.state.get() {
            ConnectionState::Pending => {
                if let Some(addr_type) = self.candidate.take() {
                    self.connect(addr_type, now);
                }
            }
            ConnectionState::Scanning => {
                info!(
                    "Scan ended without finding {}, rescanning in {:?}",
                    self.target(),
                    self.config.rescan_delay()
                );
                self.state.set(ConnectionState::Idle, now);
                self.schedule_rescan(now + self.config.rescan_delay());
            }
            state => debug!("Scan stopped in state {state:?}"),
        }
    }

    fn connect(&mut self, addr_type: AddrType, now: Instant) {
        let target = self.target();
        info!("🔌 Connecting to {target} ({addr_type:?})");
        self.link = TransportLink::Opening;
        self.state.set(ConnectionState::Connecting, now);
        if let Err(e) = self.transport.open(target, addr_type) {
            warn!("❌ Connect request failed: {e}");
            self.link = TransportLink::Closed;
            let status = match e {
                LinkError::Transport { code } => code,
                _ => -1,
            };
            self.fail(FailureSignature::ConnectFailed { status }, now);
        }
    }

    fn on_connected(&mut self, conn: ConnId, addr: BdAddr, now: Instant) {
        if self.link != TransportLink::Opening || addr != self.target() {
            warn!("Unexpected connection {conn} to {addr}, closing it");
            if let Err(e) = self.transport.close(Some(conn)) {
                warn!("Failed to close unexpected connection: {e}");
            }
            return;
        }
        info!("✅ Connected to {addr} (conn {conn}), discovering services");
        self.link = TransportLink::Open(conn);
        self.state.set(ConnectionState::DiscoveringServices, now);
        if let Err(e) = self.transport.request_mtu(conn, self.config.mtu) {
            debug!("MTU request failed: {e}, continuing with default MTU");
        }
        if let Err(e) = self.transport.search_services(conn) {
            warn!("Service search failed to start: {e}");
            self.abort(FailureSignature::DiscoveryFailed, now);
        }
    }

    fn on_service_search_complete(&mut self, ok: bool, now: Instant) {
        if self.state.get() != ConnectionState::DiscoveringServices {
            return;
        }
        let (Some(range), Some(conn)) = (self.service, self.conn()) else {
            warn!("❌ No UART service found on {} (search ok: {ok})", self.target());
            self.abort(FailureSignature::DiscoveryFailed, now);
            return;
        };
        self.state.set(ConnectionState::DiscoveringCharacteristics, now);

        let chars = match self.transport.characteristics(conn, range) {
            Ok(chars) => chars,
            Err(e) => {
                warn!("❌ Characteristic lookup failed: {e}");
                self.abort(FailureSignature::DiscoveryFailed, now);
                return;
            }
        };
        for c in &chars {
            debug!("Characteristic {:?} handle {} props {:?}", c.uuid, c.handle, c.properties);
        }

        let mut map = select_endpoints(&chars);
        let Some(notify) = map.notify.filter(|c| c.handle != 0) else {
            warn!("❌ No notify characteristic in UART service");
            self.abort(FailureSignature::DiscoveryFailed, now);
            return;
        };
        match map.write {
            Some(w) => info!("✍️ Write endpoint {:?} handle {}", w.uuid, w.handle),
            None => warn!("⚠️ No write characteristic, link will be receive-only"),
        }
        info!("📥 Notify endpoint {:?} handle {}", notify.uuid, notify.handle);

        let cccd = match self.transport.descriptor(conn, notify.handle, CCCD_UUID) {
            Some(handle) => handle,
            None => {
                // Heuristic: the CCCD usually directly follows the value handle
                let guess = notify.handle.saturating_add(1);
                warn!("CCCD lookup failed, assuming handle {guess}");
                guess
            }
        };
        map.cccd = Some(cccd);
        self.chars = map;

        self.state.set(ConnectionState::EnablingNotifications, now);
        self.notify_step = Some(NotifyStep::Registering);
        if let Err(e) = self.transport.register_for_notify(self.target(), notify.handle) {
            warn!("❌ Notify registration failed: {e}");
            self.abort(FailureSignature::DiscoveryFailed, now);
        }
    }

    fn write_cccd(&mut self, value: [u8; 2], step: NotifyStep, now: Instant) {
        let (Some(conn), Some(cccd)) = (self.conn(), self.chars.cccd) else {
            self.abort(FailureSignature::DiscoveryFailed, now);
            return;
        };
        self.notify_step = Some(step);
        if let Err(e) = self.transport.write_descriptor(conn, cccd, &value) {
            warn!("❌ CCCD write failed: {e}");
            self.abort(FailureSignature::DiscoveryFailed, now);
        }
    }

    fn on_notify_registered(&mut self, ok: bool, now: Instant) {
        if self.notify_step != Some(NotifyStep::Registering) {
            return;
        }
        if !ok {
            warn!("❌ Notify registration rejected");
            self.abort(FailureSignature::DiscoveryFailed, now);
            return;
        }
        debug!("Notify registered, enabling notifications");
        self.write_cccd(NOTIFY_ENABLE, NotifyStep::Enabling, now);
    }

    fn on_descriptor_written(&mut self, ok: bool, now: Instant) {
        match self.notify_step {
            Some(NotifyStep::Enabling) => {
                if !ok {
                    warn!("❌ Enabling notifications failed");
                    self.abort(FailureSignature::DiscoveryFailed, now);
                } else if self.config.notify_wait().is_some() {
                    debug!("Notifications enabled, toggling off and on again");
                    self.write_cccd(NOTIFY_DISABLE, NotifyStep::Disabling, now);
                } else {
                    self.ready(now);
                }
            }
            Some(NotifyStep::Disabling) => {
                if !ok {
                    warn!("Disabling notifications failed, re-enabling anyway");
                }
                let wait = self.config.notify_wait().unwrap_or_default();
                self.notify_step = Some(NotifyStep::Waiting { until: now + wait });
            }
            Some(NotifyStep::ReEnabling) => {
                if ok {
                    self.ready(now);
                } else {
                    warn!("❌ Re-enabling notifications failed");
                    self.abort(FailureSignature::DiscoveryFailed, now);
                }
            }
            step => debug!("Descriptor write completed in step {step:?}"),
        }
    }

    fn ready(&mut self, now: Instant) {
        self.notify_step = None;
        self.state.set(ConnectionState::Ready, now);
        let writable = self.chars.write.is_some();
        info!("✅ Link ready to {} (MTU {}, writable: {writable})", self.target(), self.mtu);
        self.listener.on_link_ready(writable);
    }

    fn on_notification(&mut self, handle: u16, data: &[u8]) {
        let from_notify = self.chars.notify.is_some_and(|c| c.handle == handle);
        if self.conn().is_none() || !from_notify {
            debug!("Ignoring notification from handle {handle}");
            return;
        }
        debug!("⬇️ {} bytes: {:?}", data.len(), String::from_utf8_lossy(data));
        self.listener.on_bytes(data);
    }

    fn on_disconnected(&mut self, conn: ConnId, reason: i32, now: Instant) {
        if self.link != TransportLink::Open(conn) {
            debug!("Ignoring disconnect of stale conn {conn}");
            return;
        }
        warn!("🔴 Disconnected from {} (reason 0x{reason:X})", self.target());
        self.link = TransportLink::Closed;
        self.fail(FailureSignature::Disconnected { reason }, now);
    }
}

impl<T: GattTransport> Link for GattConnectionManager<T> {
    type Event = GattEvent;

    fn handle_event(&mut self, event: GattEvent, now: Instant) {
        match event {
            GattEvent::ScanStarted { ok } => {
                if ok {
                    debug!("Scan started");
                } else if self.state.get() == ConnectionState::Scanning {
                    warn!("❌ Scan failed to start");
                    self.state.set(ConnectionState::Idle, now);
                    self.schedule_rescan(now + self.config.rescan_delay());
                }
            }
            GattEvent::ScanResult {
                addr,
                addr_type,
                rssi,
            } => self.on_scan_result(addr, addr_type, rssi, now),
            GattEvent::ScanStopped => self.on_scan_stopped(now),
            GattEvent::Connected { conn, addr } => self.on_connected(conn, addr, now),
            GattEvent::ConnectFailed { status } => {
                if self.link == TransportLink::Opening {
                    warn!("❌ Connection to {} failed (status {status})", self.target());
                    self.link = TransportLink::Closed;
                    self.fail(FailureSignature::ConnectFailed { status }, now);
                }
            }
            GattEvent::MtuConfigured { mtu, ok } => {
                if ok {
                    info!("MTU negotiated: {mtu}");
                    self.mtu = mtu;
                } else {
                    debug!("MTU negotiation failed, keeping {}", self.mtu);
                }
            }
            GattEvent::ServiceFound { uuid, range } => {
                if self.state.get() == ConnectionState::DiscoveringServices
                    && self.service.is_none()
                    && is_uart_service(&uuid)
                {
                    info!("📡 UART service {uuid:?} (handles {}..={})", range.start, range.end);
                    self.service = Some(range);
                } else {
                    debug!("Skipping service {uuid:?}");
                }
            }
            GattEvent::ServiceSearchComplete { ok } => self.on_service_search_complete(ok, now),
            GattEvent::NotifyRegistered { ok, .. } => self.on_notify_registered(ok, now),
            GattEvent::DescriptorWritten { ok, .. } => self.on_descriptor_written(ok, now),
            GattEvent::CharacteristicWritten { handle, ok } => {
                if !ok {
                    warn!("❌ Failed to write data to handle {handle}");
                }
            }
            GattEvent::Notification { handle, data } => self.on_notification(handle, &data),
            GattEvent::Disconnected { conn, reason } => self.on_disconnected(conn, reason, now),
        }
    }

    fn poll(&mut self, now: Instant) {
        if let Some(NotifyStep::Waiting { until }) = self.notify_step {
            if now >= until {
                debug!("Re-enabling notifications");
                self.write_cccd(NOTIFY_ENABLE, NotifyStep::ReEnabling, now);
            }
        }
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
            debug!("Discovery not started, state is {state:?}");
            return;
        }
        if let Some(at) = self.rescan_at {
            if at > now {
                debug!("Discovery deferred for {:?}", at - now);
                return;
            }
        }
        self.rescan_at = None;
        info!(
            "🔍 Scanning for {} ({}s)",
            self.target(),
            self.config.scan_duration_secs
        );
        match self.transport.start_scan(self.config.scan_duration()) {
            Ok(()) => self.state.set(ConnectionState::Scanning, now),
            Err(e) => {
                warn!("❌ Failed to start scan: {e}");
                self.schedule_rescan(now + self.config.rescan_delay());
            }
        }
    }

    fn stop_scan(&mut self, now: Instant) {
        if self.state.get() != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Failed to stop scan: {e}");
            self.state.set(ConnectionState::Idle, now);
            self.schedule_rescan(now + self.config.rescan_delay());
        }
    }

    fn disconnect(&mut self, now: Instant) {
        let state = self.state.get();
        if state.is_idle() && self.link == TransportLink::Closed {
            return;
        }
        info!("Disconnecting from {} (state {state:?})", self.target());
        if matches!(state, ConnectionState::Scanning | ConnectionState::Pending) {
            if let Err(e) = self.transport.stop_scan() {
                debug!("Failed to stop scan: {e}");
            }
        }
        self.close_link();
        self.teardown(now);
        self.schedule_rescan(now);
    }

    fn hard_reset(&mut self, now: Instant) {
        warn!("♻️ Hard reset of BLE connection state");
        if matches!(
            self.state.get(),
            ConnectionState::Scanning | ConnectionState::Pending
        ) {
            if let Err(e) = self.transport.stop_scan() {
                debug!("Failed to stop scan: {e}");
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
        if self.state.get() != ConnectionState::Ready {
            return Err(LinkError::NotReady);
        }
        let conn = self.conn().ok_or(LinkError::NotReady)?;
        let endpoint = self
            .chars
            .write
            .filter(|c| c.handle != 0)
            .ok_or(LinkError::NoWriteEndpoint)?;
        let with_response = !endpoint.properties.contains(CharProperty::WriteNoResponse);
        let chunk = usize::from(self.mtu.saturating_sub(3)).max(20);
        for part in data.chunks(chunk) {
            self.transport
                .write_characteristic(conn, endpoint.handle, part, with_response)?;
        }
        Ok(())
    }
}
