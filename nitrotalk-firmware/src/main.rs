use anyhow::Result;
use esp_idf_hal::cpu::Core;
use esp_idf_hal::prelude::*;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{debug, error, info, warn, LevelFilter};
use nitrotalk_link_lib::{
    AtomicConnectionState, ConnectionState, Link, LinkConfig, LinkHandle, LinkMessage, LinkTask,
};
use nitrotalk_obd_lib::{Elm327Session, Scheduler, SessionShared, Status};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(not(feature = "classic"))]
mod ble;
mod config;
#[cfg(feature = "classic")]
mod spp;
mod thread_util;
mod watchdog;

use config::Config;

/// Bluedroid log tags that flood the console at info level
const BT_STACK_TAGS: [&str; 10] = [
    "BT_RFCOMM", "BT_L2CAP", "BT_BTM", "BT_HCI", "BT_APPL", "BT_SMP", "BT_GAP", "BT_SDP",
    "BT_SPP", "BT_GATT",
];

fn apply_log_levels(config: &Config) {
    let level = config.log_level.as_level_filter();
    if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
        warn!("Failed to set log level: {e}");
    } else {
        info!("Log level set to {:?}", config.log_level);
    }

    let stack_level = if config.bt_stack_logs {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    for tag in BT_STACK_TAGS {
        if let Err(e) = esp_idf_svc::log::set_target_level(tag, stack_level) {
            debug!("Failed to set level of {tag}: {e}");
        }
    }
}

/// The link task sits next to the Bluetooth controller on core 0
fn spawn_link_task<L>(link: L, config: &LinkConfig, rx: Receiver<LinkMessage<L::Event>>) -> Result<()>
where
    L: Link + Send + 'static,
{
    let task = LinkTask::new(link, config, rx);
    thread_util::spawn_named(c"link_task", Some(Core::Core0), move || {
        task.run(watchdog::heartbeat(c"link_task"));
        error!("Link task exited");
    })?;
    Ok(())
}

fn spawn_scheduler<E: Send + 'static>(
    shared: Arc<SessionShared>,
    writer: LinkHandle<E>,
    config: &Config,
) -> Result<()> {
    let session = Elm327Session::new(shared, writer, config.session.clone());
    let mut scheduler = Scheduler::new(session, config.polling.clone());
    thread_util::spawn_named(c"obd_poll", Some(Core::Core1), move || {
        // Runs for the life of the device
        let shutdown = AtomicBool::new(false);
        scheduler.run(&shutdown, watchdog::heartbeat(c"obd_poll"));
    })?;
    Ok(())
}

fn report_status(status: &Status, interval: Duration) -> ! {
    loop {
        std::thread::sleep(interval);
        let snapshot = status.snapshot();
        let telemetry = snapshot.telemetry;
        info!(
            "RPM: {} | Throttle: {}% | Speed: {} km/h | Gear: {} | Link: {:?} | ECU: {:?}",
            telemetry.rpm,
            telemetry.throttle_pct,
            telemetry.speed_kmh,
            snapshot.gear,
            snapshot.connection,
            snapshot.ecu
        );
        if snapshot.ecu_unreachable {
            warn!("ECU unreachable, waiting for the adapter link to be re-established");
        }
        match serde_json::to_string(&snapshot) {
            Ok(json) => debug!("Status: {json}"),
            Err(e) => warn!("Failed to serialize status: {e}"),
        }
    }
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting nitrotalk firmware {}...", env!("GIT_VERSION"));

    let peripherals = Peripherals::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    config::init_nvs(nvs.clone())?;
    let config = Config::load_or_default();
    apply_log_levels(&config);

    let connection = Arc::new(AtomicConnectionState::new(ConnectionState::Idle));
    let status = Arc::new(Status::new(connection.clone()));
    status.set_auto_injection(config::load_auto_injection());

    let shared = SessionShared::new(&config.session, status.clone());
    let (tx, rx) = mpsc::channel();
    let handle = LinkHandle::new(tx, &config.link);

    info!("Initializing Bluetooth...");
    #[cfg(not(feature = "classic"))]
    let _bt = {
        let bt = esp_idf_svc::bt::BtDriver::<esp_idf_svc::bt::Ble>::new(peripherals.modem, Some(nvs))?;
        let transport = ble::init(handle.events(), config.link.mtu)?;
        let link = nitrotalk_link_lib::GattConnectionManager::new(
            transport,
            config.link.clone(),
            shared.clone(),
            connection,
            Instant::now(),
        );
        spawn_link_task(link, &config.link, rx)?;
        bt
    };
    #[cfg(feature = "classic")]
    let _bt = {
        let bt =
            esp_idf_svc::bt::BtDriver::<esp_idf_svc::bt::BtClassic>::new(peripherals.modem, Some(nvs))?;
        let transport = spp::init(handle.events())?;
        let link = nitrotalk_link_lib::SppConnectionManager::new(
            transport,
            config.link.clone(),
            shared.clone(),
            connection,
            Instant::now(),
        );
        spawn_link_task(link, &config.link, rx)?;
        bt
    };
    info!("Adapter link task started, target {}", config.link.target);

    spawn_scheduler(shared, handle, &config)?;
    info!("Polling scheduler started");

    report_status(&status, Duration::from_millis(config.status_interval_ms))
}
