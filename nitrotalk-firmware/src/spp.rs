//! Bluedroid Classic glue: GAP inquiry and SPP (RFCOMM)
//!
//! Same shape as the BLE glue: callbacks become [`SppEvent`]s on the link
//! task's channel, [`SppTransport`] methods only issue requests.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use esp_idf_svc::sys::*;
use log::{debug, info, trace, warn};
use nitrotalk_link_lib::{BdAddr, LinkError, LinkMessage, LinkSender, SppEvent, SppTransport};

/// Inquiry length unit
const INQUIRY_UNIT: Duration = Duration::from_millis(1280);
/// Longest inquiry the controller accepts, in units
const MAX_INQUIRY_UNITS: u8 = 0x30;
const SPP_TX_BUFFER: u16 = 512;

static EVENTS: OnceLock<LinkSender<SppEvent>> = OnceLock::new();

fn post(event: SppEvent) {
    if let Some(tx) = EVENTS.get() {
        if tx.send(LinkMessage::Event(event)).is_err() {
            debug!("Link task gone, dropping SPP event");
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

fn spp_ok(status: esp_spp_status_t) -> bool {
    status == esp_spp_status_t_ESP_SPP_SUCCESS
}

fn status_code(status: u32) -> i32 {
    i32::try_from(status).unwrap_or(-1)
}

unsafe extern "C" fn gap_callback(event: esp_bt_gap_cb_event_t, param: *mut esp_bt_gap_cb_param_t) {
    // SAFETY: Bluedroid passes a valid parameter block for the callback's duration
    let Some(param) = (unsafe { param.as_ref() }) else {
        return;
    };
    #[allow(non_upper_case_globals)]
    match event {
        esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_RES_EVT => {
            let addr = BdAddr(unsafe { param.disc_res.bda });
            post(SppEvent::DeviceFound { addr });
        }
        esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_STATE_CHANGED_EVT => {
            match unsafe { param.disc_st_chg.state } {
                esp_bt_gap_discovery_state_t_ESP_BT_GAP_DISCOVERY_STARTED => {
                    post(SppEvent::InquiryStarted { ok: true });
                }
                esp_bt_gap_discovery_state_t_ESP_BT_GAP_DISCOVERY_STOPPED => {
                    post(SppEvent::InquiryStopped);
                }
                _ => {}
            }
        }
        _ => trace!("GAP BT event {event}"),
    }
}

unsafe extern "C" fn spp_callback(event: esp_spp_cb_event_t, param: *mut esp_spp_cb_param_t) {
    // SAFETY: Bluedroid passes a valid parameter block for the callback's duration
    let Some(param) = (unsafe { param.as_ref() }) else {
        return;
    };
    #[allow(non_upper_case_globals)]
    match event {
        esp_spp_cb_event_t_ESP_SPP_INIT_EVT => {
            let status = unsafe { param.init.status };
            if spp_ok(status) {
                info!("SPP initialized");
            } else {
                warn!("❌ SPP initialization failed: {status}");
            }
        }
        esp_spp_cb_event_t_ESP_SPP_CL_INIT_EVT => {
            let cl_init = unsafe { &param.cl_init };
            if !spp_ok(cl_init.status) {
                post(SppEvent::OpenFailed {
                    status: status_code(cl_init.status),
                });
            }
        }
        esp_spp_cb_event_t_ESP_SPP_OPEN_EVT => {
            let open = unsafe { &param.open };
            if spp_ok(open.status) {
                post(SppEvent::Opened { handle: open.handle });
            } else {
                post(SppEvent::OpenFailed {
                    status: status_code(open.status),
                });
            }
        }
        esp_spp_cb_event_t_ESP_SPP_CLOSE_EVT => {
            let close = unsafe { &param.close };
            // Before the open completed this is a failed open, after it a
            // closed link; the manager ignores whichever does not apply
            post(SppEvent::OpenFailed {
                status: status_code(close.status),
            });
            post(SppEvent::Closed {
                handle: close.handle,
                reason: status_code(close.port_status),
            });
        }
        esp_spp_cb_event_t_ESP_SPP_DATA_IND_EVT => {
            let ind = unsafe { &param.data_ind };
            if ind.data.is_null() {
                return;
            }
            let data = unsafe { std::slice::from_raw_parts(ind.data, usize::from(ind.len)) };
            trace!("SPP data {}: {}", ind.handle, hex::encode(data));
            post(SppEvent::Data {
                handle: ind.handle,
                data: data.to_vec(),
            });
        }
        esp_spp_cb_event_t_ESP_SPP_WRITE_EVT => {
            let write = unsafe { &param.write };
            if !spp_ok(write.status) {
                post(SppEvent::WriteFailed {
                    status: status_code(write.status),
                });
            }
        }
        _ => trace!("SPP event {event}"),
    }
}

/// Register the callbacks and bring up SPP in callback mode
pub fn init(events: LinkSender<SppEvent>) -> Result<ClassicTransport> {
    EVENTS
        .set(events)
        .map_err(|_| anyhow!("Classic glue already initialized"))?;

    esp!(unsafe { esp_bt_gap_register_callback(Some(gap_callback)) })?;
    esp!(unsafe { esp_spp_register_callback(Some(spp_callback)) })?;
    let config = esp_spp_cfg_t {
        mode: esp_spp_mode_t_ESP_SPP_MODE_CB,
        enable_l2cap_ertm: true,
        tx_buffer_size: SPP_TX_BUFFER,
    };
    esp!(unsafe { esp_spp_enhanced_init(&config) })?;
    info!("✅ Classic SPP ready");
    Ok(ClassicTransport)
}

pub struct ClassicTransport;

impl SppTransport for ClassicTransport {
    fn start_inquiry(&mut self, duration: Duration) -> Result<(), LinkError> {
        let units = duration.as_millis() / INQUIRY_UNIT.as_millis();
        let units = u8::try_from(units).unwrap_or(MAX_INQUIRY_UNITS).clamp(1, MAX_INQUIRY_UNITS);
        check(unsafe {
            esp_bt_gap_start_discovery(esp_bt_inq_mode_t_ESP_BT_INQ_MODE_GENERAL_INQUIRY, units, 0)
        })
    }

    fn cancel_inquiry(&mut self) -> Result<(), LinkError> {
        check(unsafe { esp_bt_gap_cancel_discovery() })
    }

    fn connect(&mut self, addr: BdAddr, channel: u8) -> Result<(), LinkError> {
        let mut bda = addr.0;
        check(unsafe {
            esp_spp_connect(
                ESP_SPP_SEC_NONE as esp_spp_sec_t,
                esp_spp_role_t_ESP_SPP_ROLE_MASTER,
                channel,
                bda.as_mut_ptr(),
            )
        })
    }

    fn disconnect(&mut self, handle: u32) -> Result<(), LinkError> {
        check(unsafe { esp_spp_disconnect(handle) })
    }

    fn write(&mut self, handle: u32, data: &[u8]) -> Result<(), LinkError> {
        let mut data = data.to_vec();
        let len = i32::try_from(data.len()).map_err(|_| LinkError::Transport { code: -1 })?;
        check(unsafe { esp_spp_write(handle, len, data.as_mut_ptr()) })
    }
}
