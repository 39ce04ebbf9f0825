//! Bluedroid BLE central glue
//!
//! GAP and GATTC callbacks run on the Bluedroid task. They only translate
//! the callback parameters into [`GattEvent`]s and post them to the link
//! task's channel; all decisions are made there by the connection manager.
//! [`BleTransport`] issues the requests, each completion comes back through
//! the callbacks.

use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::sys::*;
use log::{debug, info, trace, warn};
use nitrotalk_link_lib::{
    AddrType, BdAddr, BtUuid, CharProperty, Characteristic, ConnId, GattEvent, GattTransport,
    LinkError, LinkMessage, LinkSender, ServiceRange,
};

const APP_ID: u16 = 0;
/// `ESP_GATT_IF_NONE`
const NO_INTERFACE: u8 = 0xFF;
const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);

static EVENTS: OnceLock<LinkSender<GattEvent>> = OnceLock::new();
static GATTC_IF: AtomicU8 = AtomicU8::new(NO_INTERFACE);

fn post(event: GattEvent) {
    if let Some(tx) = EVENTS.get() {
        if tx.send(LinkMessage::Event(event)).is_err() {
            debug!("Link task gone, dropping GATT event");
        }
    }
}

fn check(code: esp_err_t) -> Result<(), LinkError> {
    if code == ESP_OK as esp_err_t {
        Ok(())
    } else {
        Err(LinkError::Transport { code })
    }
}

fn gatt_ok(status: esp_gatt_status_t) -> bool {
    status == esp_gatt_status_t_ESP_GATT_OK
}

fn status_code(status: u32) -> i32 {
    i32::try_from(status).unwrap_or(-1)
}

fn uuid_from_esp(uuid: &esp_bt_uuid_t) -> BtUuid {
    // SAFETY: `len` says which union member is valid
    unsafe {
        match u32::from(uuid.len) {
            ESP_UUID_LEN_16 => BtUuid::U16(uuid.uuid.uuid16),
            ESP_UUID_LEN_32 => BtUuid::from_u128(
                (u128::from(uuid.uuid.uuid32) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB,
            ),
            _ => BtUuid::U128(uuid.uuid.uuid128),
        }
    }
}

fn uuid_to_esp(uuid: BtUuid) -> esp_bt_uuid_t {
    match uuid {
        BtUuid::U16(v) => esp_bt_uuid_t {
            len: ESP_UUID_LEN_16 as u16,
            uuid: esp_bt_uuid_t__bindgen_ty_1 { uuid16: v },
        },
        BtUuid::U128(bytes) => esp_bt_uuid_t {
            len: ESP_UUID_LEN_128 as u16,
            uuid: esp_bt_uuid_t__bindgen_ty_1 { uuid128: bytes },
        },
    }
}

unsafe extern "C" fn gap_callback(event: esp_gap_ble_cb_event_t, param: *mut esp_ble_gap_cb_param_t) {
    // SAFETY: Bluedroid passes a valid parameter block for the callback's duration
    let Some(param) = (unsafe { param.as_ref() }) else {
        return;
    };
    #[allow(non_upper_case_globals)]
    match event {
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RESULT_EVT => {
            let result = unsafe { &param.scan_rst };
            match result.search_evt {
                esp_gap_search_evt_t_ESP_GAP_SEARCH_INQ_RES_EVT => post(GattEvent::ScanResult {
                    addr: BdAddr(result.bda),
                    addr_type: AddrType::from_raw(result.ble_addr_type),
                    rssi: i8::try_from(result.rssi).unwrap_or(i8::MIN),
                }),
                // Scan duration elapsed
                esp_gap_search_evt_t_ESP_GAP_SEARCH_INQ_CMPL_EVT => post(GattEvent::ScanStopped),
                _ => {}
            }
        }
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_START_COMPLETE_EVT => {
            let status = unsafe { param.scan_start_cmpl.status };
            post(GattEvent::ScanStarted {
                ok: status == esp_bt_status_t_ESP_BT_STATUS_SUCCESS,
            });
        }
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_STOP_COMPLETE_EVT => post(GattEvent::ScanStopped),
        _ => trace!("GAP BLE event {event}"),
    }
}

unsafe extern "C" fn gattc_callback(
    event: esp_gattc_cb_event_t,
    gattc_if: esp_gatt_if_t,
    param: *mut esp_ble_gattc_cb_param_t,
) {
    // SAFETY: Bluedroid passes a valid parameter block for the callback's duration
    let Some(param) = (unsafe { param.as_ref() }) else {
        return;
    };
    #[allow(non_upper_case_globals)]
    match event {
        esp_gattc_cb_event_t_ESP_GATTC_REG_EVT => {
            let reg = unsafe { &param.reg };
            if gatt_ok(reg.status) {
                info!("GATT client registered, interface {gattc_if}");
                GATTC_IF.store(gattc_if, Ordering::Release);
            } else {
                warn!("❌ GATT client registration failed: {}", reg.status);
            }
        }
        esp_gattc_cb_event_t_ESP_GATTC_OPEN_EVT => {
            let open = unsafe { &param.open };
            if gatt_ok(open.status) {
                post(GattEvent::Connected {
                    conn: open.conn_id,
                    addr: BdAddr(open.remote_bda),
                });
            } else {
                post(GattEvent::ConnectFailed {
                    status: status_code(open.status),
                });
            }
        }
        esp_gattc_cb_event_t_ESP_GATTC_DISCONNECT_EVT => {
            let disconnect = unsafe { &param.disconnect };
            post(GattEvent::Disconnected {
                conn: disconnect.conn_id,
                reason: status_code(disconnect.reason),
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_CFG_MTU_EVT => {
            let mtu = unsafe { &param.cfg_mtu };
            post(GattEvent::MtuConfigured {
                mtu: mtu.mtu,
                ok: gatt_ok(mtu.status),
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_SEARCH_RES_EVT => {
            let res = unsafe { &param.search_res };
            post(GattEvent::ServiceFound {
                uuid: uuid_from_esp(&res.srvc_id.uuid),
                range: ServiceRange {
                    start: res.start_handle,
                    end: res.end_handle,
                },
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_SEARCH_CMPL_EVT => {
            let status = unsafe { param.search_cmpl.status };
            post(GattEvent::ServiceSearchComplete { ok: gatt_ok(status) });
        }
        esp_gattc_cb_event_t_ESP_GATTC_REG_FOR_NOTIFY_EVT => {
            let reg = unsafe { &param.reg_for_notify };
            post(GattEvent::NotifyRegistered {
                handle: reg.handle,
                ok: gatt_ok(reg.status),
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_WRITE_DESCR_EVT => {
            let write = unsafe { &param.write };
            post(GattEvent::DescriptorWritten {
                handle: write.handle,
                ok: gatt_ok(write.status),
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_WRITE_CHAR_EVT => {
            let write = unsafe { &param.write };
            post(GattEvent::CharacteristicWritten {
                handle: write.handle,
                ok: gatt_ok(write.status),
            });
        }
        esp_gattc_cb_event_t_ESP_GATTC_NOTIFY_EVT => {
            let notify = unsafe { &param.notify };
            if notify.value.is_null() {
                return;
            }
            let data =
                unsafe { std::slice::from_raw_parts(notify.value, usize::from(notify.value_len)) };
            trace!("GATTC notify {}: {}", notify.handle, hex::encode(data));
            post(GattEvent::Notification {
                handle: notify.handle,
                data: data.to_vec(),
            });
        }
        _ => trace!("GATTC event {event}"),
    }
}

/// Register the callbacks and the GATT client application
///
/// Must run after the Bluedroid host is enabled and only once per boot.
pub fn init(events: LinkSender<GattEvent>, mtu: u16) -> Result<BleTransport> {
    EVENTS
        .set(events)
        .map_err(|_| anyhow!("BLE glue already initialized"))?;

    esp!(unsafe { esp_ble_gap_register_callback(Some(gap_callback)) })?;
    esp!(unsafe { esp_ble_gattc_register_callback(Some(gattc_callback)) })?;
    if let Err(e) = esp!(unsafe { esp_ble_gatt_set_local_mtu(mtu) }) {
        warn!("Failed to set local MTU {mtu}: {e}");
    }
    esp!(unsafe { esp_ble_gattc_app_register(APP_ID) })?;

    // The interface arrives with the registration event
    let deadline = Instant::now() + REGISTER_TIMEOUT;
    while GATTC_IF.load(Ordering::Acquire) == NO_INTERFACE {
        if Instant::now() >= deadline {
            bail!("GATT client registration timed out");
        }
        FreeRtos::delay_ms(10);
    }
    info!("✅ BLE GATT client ready");
    Ok(BleTransport { pending: None })
}

pub struct BleTransport {
    /// Target of an open request that has not completed yet
    pending: Option<BdAddr>,
}

impl BleTransport {
    fn gattc_if(&self) -> esp_gatt_if_t {
        GATTC_IF.load(Ordering::Acquire)
    }
}

impl GattTransport for BleTransport {
    fn start_scan(&mut self, duration: Duration) -> Result<(), LinkError> {
        let mut params = esp_ble_scan_params_t {
            scan_type: esp_ble_scan_type_t_BLE_SCAN_TYPE_ACTIVE,
            own_addr_type: esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            scan_filter_policy: esp_ble_scan_filter_t_BLE_SCAN_FILTER_ALLOW_ALL,
            // 50 ms interval, 30 ms window (0.625 ms units)
            scan_interval: 0x50,
            scan_window: 0x30,
            scan_duplicate: esp_ble_scan_duplicate_t_BLE_SCAN_DUPLICATE_DISABLE,
        };
        check(unsafe { esp_ble_gap_set_scan_params(&mut params) })?;
        let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX);
        check(unsafe { esp_ble_gap_start_scanning(secs) })
    }

    fn stop_scan(&mut self) -> Result<(), LinkError> {
        check(unsafe { esp_ble_gap_stop_scanning() })
    }

    fn open(&mut self, addr: BdAddr, addr_type: AddrType) -> Result<(), LinkError> {
        let mut bda = addr.0;
        self.pending = Some(addr);
        check(unsafe {
            esp_ble_gattc_open(self.gattc_if(), bda.as_mut_ptr(), addr_type.to_raw(), true)
        })
    }

    fn close(&mut self, conn: Option<ConnId>) -> Result<(), LinkError> {
        match conn {
            Some(conn) => {
                self.pending = None;
                check(unsafe { esp_ble_gattc_close(self.gattc_if(), conn) })
            }
            // Cancel a pending open at the GAP level
            None => match self.pending.take() {
                Some(addr) => {
                    let mut bda = addr.0;
                    check(unsafe { esp_ble_gap_disconnect(bda.as_mut_ptr()) })
                }
                None => Ok(()),
            },
        }
    }

    fn request_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<(), LinkError> {
        check(unsafe { esp_ble_gatt_set_local_mtu(mtu) })?;
        check(unsafe { esp_ble_gattc_send_mtu_req(self.gattc_if(), conn) })
    }

    fn search_services(&mut self, conn: ConnId) -> Result<(), LinkError> {
        self.pending = None;
        check(unsafe { esp_ble_gattc_search_service(self.gattc_if(), conn, ptr::null_mut()) })
    }

    fn characteristics(
        &mut self,
        conn: ConnId,
        range: ServiceRange,
    ) -> Result<Vec<Characteristic>, LinkError> {
        let gattc_if = self.gattc_if();
        let mut count: u16 = 0;
        let status = unsafe {
            esp_ble_gattc_get_attr_count(
                gattc_if,
                conn,
                esp_gatt_db_attr_type_t_ESP_GATT_DB_CHARACTERISTIC,
                range.start,
                range.end,
                0,
                &mut count,
            )
        };
        if !gatt_ok(status) {
            return Err(LinkError::Transport {
                code: status_code(status),
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut elems = vec![esp_gattc_char_elem_t::default(); usize::from(count)];
        let status = unsafe {
            esp_ble_gattc_get_all_char(
                gattc_if,
                conn,
                range.start,
                range.end,
                elems.as_mut_ptr(),
                &mut count,
                0,
            )
        };
        if !gatt_ok(status) {
            return Err(LinkError::Transport {
                code: status_code(status),
            });
        }
        elems.truncate(usize::from(count));
        Ok(elems
            .iter()
            .map(|e| Characteristic {
                uuid: uuid_from_esp(&e.uuid),
                handle: e.char_handle,
                properties: CharProperty::from_bits(e.properties),
            })
            .collect())
    }

    fn descriptor(&mut self, conn: ConnId, char_handle: u16, uuid: BtUuid) -> Option<u16> {
        let mut elem = esp_gattc_descr_elem_t::default();
        let mut count: u16 = 1;
        let status = unsafe {
            esp_ble_gattc_get_descr_by_char_handle(
                self.gattc_if(),
                conn,
                char_handle,
                uuid_to_esp(uuid),
                &mut elem,
                &mut count,
            )
        };
        (gatt_ok(status) && count > 0).then_some(elem.handle)
    }

    fn register_for_notify(&mut self, addr: BdAddr, handle: u16) -> Result<(), LinkError> {
        let mut bda = addr.0;
        check(unsafe { esp_ble_gattc_register_for_notify(self.gattc_if(), bda.as_mut_ptr(), handle) })
    }

    fn write_descriptor(&mut self, conn: ConnId, handle: u16, value: &[u8]) -> Result<(), LinkError> {
        let mut value = value.to_vec();
        let len = u16::try_from(value.len()).map_err(|_| LinkError::Transport { code: -1 })?;
        check(unsafe {
            esp_ble_gattc_write_char_descr(
                self.gattc_if(),
                conn,
                handle,
                len,
                value.as_mut_ptr(),
                esp_gatt_write_type_t_ESP_GATT_WRITE_TYPE_RSP,
                esp_gatt_auth_req_t_ESP_GATT_AUTH_REQ_NONE,
            )
        })
    }

    fn write_characteristic(
        &mut self,
        conn: ConnId,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError> {
        let mut data = data.to_vec();
        let len = u16::try_from(data.len()).map_err(|_| LinkError::Transport { code: -1 })?;
        let write_type = if with_response {
            esp_gatt_write_type_t_ESP_GATT_WRITE_TYPE_RSP
        } else {
            esp_gatt_write_type_t_ESP_GATT_WRITE_TYPE_NO_RSP
        };
        trace!("GATTC write {handle}: {}", hex::encode(&data));
        check(unsafe {
            esp_ble_gattc_write_char(
                self.gattc_if(),
                conn,
                handle,
                len,
                data.as_mut_ptr(),
                write_type,
                esp_gatt_auth_req_t_ESP_GATT_AUTH_REQ_NONE,
            )
        })
    }
}
