//! A BLE ELM327 adapter that lives in the process
//!
//! Implements [`GattTransport`] the way the Bluedroid glue does: every
//! request is answered by posting the completion event to the link task's
//! channel. Writes to the UART characteristic go to a [`SimulatedAdapter`]
//! and its reply comes back as MTU-sized notifications.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use nitrotalk_elm327_lib::SimulatedAdapter;
use nitrotalk_link_lib::gatt::{NOTIFY_DISABLE, NOTIFY_ENABLE};
use nitrotalk_link_lib::{
    AddrType, BdAddr, BtUuid, CharProperty, Characteristic, ConnId, GattEvent, GattTransport,
    LinkError, LinkMessage, LinkSender, ServiceRange,
};

pub const CONN: ConnId = 1;
const SERVICE: ServiceRange = ServiceRange { start: 1, end: 8 };
const NOTIFY_HANDLE: u16 = 3;
const CCCD_HANDLE: u16 = 4;
const WRITE_HANDLE: u16 = 6;
/// HCI "remote user terminated connection"
const REASON_REMOTE_CLOSED: i32 = 0x13;

#[derive(Debug, Default)]
struct Peripheral {
    connected: bool,
    mtu: u16,
    /// CCCD currently holds the enable value
    enabled: bool,
    /// Notifications were switched off and on again since connecting
    toggled: bool,
    notifications_sent: usize,
}

/// Shared view of the simulated peripheral, for the driver and tests
#[derive(Clone)]
pub struct SimPeripheral {
    adapter: Arc<Mutex<SimulatedAdapter>>,
    state: Arc<Mutex<Peripheral>>,
    /// Adapter firmware that only notifies after a disable/enable round trip
    toggle_quirk: bool,
}

impl SimPeripheral {
    pub fn new(adapter: SimulatedAdapter, toggle_quirk: bool) -> Self {
        Self {
            adapter: Arc::new(Mutex::new(adapter)),
            state: Arc::default(),
            toggle_quirk,
        }
    }

    pub fn adapter(&self) -> MutexGuard<'_, SimulatedAdapter> {
        self.adapter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, Peripheral> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn notifications_sent(&self) -> usize {
        self.state().notifications_sent
    }

    /// Mark the connection gone, as a supervision timeout would
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.enabled = false;
        state.toggled = false;
    }

    fn notifying(&self) -> bool {
        let state = self.state();
        state.connected && state.enabled && (state.toggled || !self.toggle_quirk)
    }
}

pub struct SimGattTransport {
    target: BdAddr,
    peripheral: SimPeripheral,
    events: LinkSender<GattEvent>,
}

impl SimGattTransport {
    pub fn new(target: BdAddr, peripheral: SimPeripheral, events: LinkSender<GattEvent>) -> Self {
        Self {
            target,
            peripheral,
            events,
        }
    }

    fn post(&self, event: GattEvent) {
        trace!("SIM event {event:?}");
        if self.events.send(LinkMessage::Event(event)).is_err() {
            debug!("Link task gone, dropping simulated event");
        }
    }
}

impl GattTransport for SimGattTransport {
    fn start_scan(&mut self, _duration: Duration) -> Result<(), LinkError> {
        self.post(GattEvent::ScanStarted { ok: true });
        self.post(GattEvent::ScanResult {
            addr: self.target,
            addr_type: AddrType::Public,
            rssi: -58,
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), LinkError> {
        self.post(GattEvent::ScanStopped);
        Ok(())
    }

    fn open(&mut self, addr: BdAddr, _addr_type: AddrType) -> Result<(), LinkError> {
        if addr != self.target {
            self.post(GattEvent::ConnectFailed { status: 0x85 });
            return Ok(());
        }
        *self.peripheral.state() = Peripheral {
            connected: true,
            mtu: 23,
            ..Peripheral::default()
        };
        self.post(GattEvent::Connected { conn: CONN, addr });
        Ok(())
    }

    fn close(&mut self, conn: Option<ConnId>) -> Result<(), LinkError> {
        self.peripheral.drop_link();
        if let Some(conn) = conn {
            self.post(GattEvent::Disconnected {
                conn,
                reason: REASON_REMOTE_CLOSED,
            });
        }
        Ok(())
    }

    fn request_mtu(&mut self, _conn: ConnId, mtu: u16) -> Result<(), LinkError> {
        self.peripheral.state().mtu = mtu;
        self.post(GattEvent::MtuConfigured { mtu, ok: true });
        Ok(())
    }

    fn search_services(&mut self, _conn: ConnId) -> Result<(), LinkError> {
        self.post(GattEvent::ServiceFound {
            uuid: BtUuid::U16(0x1801),
            range: ServiceRange { start: 0x10, end: 0x14 },
        });
        self.post(GattEvent::ServiceFound {
            uuid: BtUuid::U16(0xFFF0),
            range: SERVICE,
        });
        self.post(GattEvent::ServiceSearchComplete { ok: true });
        Ok(())
    }

    fn characteristics(
        &mut self,
        _conn: ConnId,
        range: ServiceRange,
    ) -> Result<Vec<Characteristic>, LinkError> {
        if range != SERVICE {
            return Ok(Vec::new());
        }
        Ok(vec![
            Characteristic {
                uuid: BtUuid::U16(0xFFF1),
                handle: NOTIFY_HANDLE,
                properties: CharProperty::Read | CharProperty::Notify,
            },
            Characteristic {
                uuid: BtUuid::U16(0xFFF2),
                handle: WRITE_HANDLE,
                properties: CharProperty::Write | CharProperty::WriteNoResponse,
            },
        ])
    }

    fn descriptor(&mut self, _conn: ConnId, char_handle: u16, _uuid: BtUuid) -> Option<u16> {
        (char_handle == NOTIFY_HANDLE).then_some(CCCD_HANDLE)
    }

    fn register_for_notify(&mut self, _addr: BdAddr, handle: u16) -> Result<(), LinkError> {
        self.post(GattEvent::NotifyRegistered {
            handle,
            ok: handle == NOTIFY_HANDLE,
        });
        Ok(())
    }

    fn write_descriptor(&mut self, _conn: ConnId, handle: u16, value: &[u8]) -> Result<(), LinkError> {
        let ok = handle == CCCD_HANDLE;
        if ok {
            let mut state = self.peripheral.state();
            if value == NOTIFY_ENABLE {
                state.enabled = true;
            } else if value == NOTIFY_DISABLE {
                if state.enabled {
                    state.toggled = true;
                }
                state.enabled = false;
            }
        }
        self.post(GattEvent::DescriptorWritten { handle, ok });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        conn: ConnId,
        handle: u16,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), LinkError> {
        if conn != CONN || !self.peripheral.is_connected() {
            return Err(LinkError::NotReady);
        }
        if handle != WRITE_HANDLE {
            self.post(GattEvent::CharacteristicWritten { handle, ok: false });
            return Ok(());
        }
        let reply = self.peripheral.adapter().feed(data);
        if !self.peripheral.notifying() {
            debug!("SIM: notifications not active, {} reply bytes lost", reply.len());
            return Ok(());
        }
        let chunk = usize::from(self.peripheral.state().mtu.saturating_sub(3)).max(20);
        for part in reply.chunks(chunk) {
            self.post(GattEvent::Notification {
                handle: NOTIFY_HANDLE,
                data: part.to_vec(),
            });
            self.peripheral.state().notifications_sent += 1;
        }
        Ok(())
    }
}
