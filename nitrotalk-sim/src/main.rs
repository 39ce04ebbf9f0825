//! Host simulator for the nitrotalk client stack
//!
//! Runs the real link task, session engine and polling scheduler against an
//! in-process BLE ELM327 adapter, printing the status snapshot as JSON.
//! Faults (ECU off, link drops, notification quirks) can be injected from
//! the command line.
//!
//! Usage: cargo run -p nitrotalk-sim -- [OPTIONS]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use nitrotalk_elm327_lib::{InitProfile, SimulatedAdapter, VehicleState};
use nitrotalk_link_lib::{
    AtomicConnectionState, ConnectionState, GattConnectionManager, GattEvent, LinkConfig,
    LinkHandle, LinkMessage, LinkTask, NotifyStrategy,
};
use nitrotalk_obd_lib::{Elm327Session, PollingConfig, Scheduler, SessionConfig, SessionShared, Status};

mod transport;

use transport::{SimGattTransport, SimPeripheral, CONN};

/// HCI "connection timeout", what a car's adapter losing power looks like
const REASON_SUPERVISION_TIMEOUT: i32 = 0x08;

#[derive(Parser, Debug)]
#[command(name = "nitrotalk-sim")]
#[command(about = "Run the OBD-II client against a simulated BLE ELM327 adapter")]
#[allow(clippy::struct_excessive_bools)] // Independent fault switches
struct Args {
    /// How long to run in seconds (0 = run forever)
    #[arg(short, long, default_value = "20")]
    duration_secs: u64,

    /// Interval between status printouts in milliseconds
    #[arg(short, long, default_value = "1000")]
    status_ms: u64,

    /// Start with the ignition off (ECU not answering)
    #[arg(long)]
    ecu_off: bool,

    /// Turn the ECU on after this many seconds
    #[arg(long)]
    ecu_on_after_secs: Option<u64>,

    /// Drop the BLE link after this many seconds
    #[arg(long)]
    drop_after_secs: Option<u64>,

    /// Adapter only notifies after notifications were toggled off and on
    #[arg(long)]
    toggle_quirk: bool,

    /// Enable notifications once instead of toggling them
    #[arg(long)]
    single_notify: bool,

    /// Adapter prints SEARCHING... before its first OBD answer
    #[arg(long)]
    searching: bool,

    /// Adapter splits long replies into numbered CAN frames
    #[arg(long)]
    can_frames: bool,

    /// Use the compact initialization sequence
    #[arg(long)]
    compact: bool,

    /// Keep the adapter's real settle times instead of shortened ones
    #[arg(long)]
    real_timing: bool,

    /// Debug logging (twice for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig {
            scan_duration_secs: 5,
            rescan_delay_ms: 1000,
            backoff_base_ms: 250,
            tick_ms: 10,
            notify: if self.single_notify {
                NotifyStrategy::Single
            } else {
                NotifyStrategy::default()
            },
            ..LinkConfig::default()
        };
        config.validate();
        config
    }

    fn session_config(&self) -> SessionConfig {
        let init_profile = if self.compact {
            InitProfile::Compact
        } else {
            InitProfile::Full
        };
        let mut config = if self.real_timing {
            SessionConfig {
                init_profile,
                ..SessionConfig::default()
            }
        } else {
            SessionConfig {
                init_profile,
                post_connect_settle_ms: 200,
                command_settle_ms: 20,
                reset_settle_ms: 200,
                diagnostic_settle_ms: 50,
                probe_settle_ms: 100,
                ecu_probe_timeout_ms: 500,
                ecu_probe_pause_ms: 200,
                ..SessionConfig::default()
            }
        };
        config.validate();
        config
    }

    fn polling_config(&self) -> PollingConfig {
        let mut config = if self.real_timing {
            PollingConfig::default()
        } else {
            PollingConfig {
                probe_round_delay_ms: 500,
                ..PollingConfig::default()
            }
        };
        config.validate();
        config
    }
}

/// Engine speed sweeping 800 to 3500 rpm: ramp up, hold, ramp down, idle
fn ramp_rpm(elapsed: Duration) -> u32 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let phase = elapsed.as_secs_f32() % CYCLE_TIME;
    let rpm = if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // 800..=3500
    let rpm = rpm as u32;
    rpm
}

/// Throttle follows engine speed
fn throttle_for(rpm: u32) -> u8 {
    u8::try_from(rpm.saturating_sub(800) * 100 / 2700).unwrap_or(100)
}

/// Fires once when its deadline passes
struct Fault {
    at: Option<Duration>,
}

impl Fault {
    fn new(after_secs: Option<u64>) -> Self {
        Self {
            at: after_secs.map(Duration::from_secs),
        }
    }

    fn due(&mut self, elapsed: Duration) -> bool {
        match self.at {
            Some(at) if elapsed >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(args.log_level())
        .format_timestamp_millis()
        .init();

    info!("Starting nitrotalk simulator {}...", env!("CARGO_PKG_VERSION"));

    let link_config = args.link_config();
    let session_config = args.session_config();
    let polling_config = args.polling_config();

    let vehicle = VehicleState {
        ecu_online: !args.ecu_off,
        ..VehicleState::default()
    };
    let mut adapter = SimulatedAdapter::new(vehicle);
    if args.searching {
        adapter = adapter.with_search_preamble();
    }
    if args.can_frames {
        adapter = adapter.with_can_frames();
    }
    let peripheral = SimPeripheral::new(adapter, args.toggle_quirk);

    let connection = Arc::new(AtomicConnectionState::new(ConnectionState::Idle));
    let status = Arc::new(Status::new(connection.clone()));
    let shared = SessionShared::new(&session_config, status.clone());

    let (tx, rx) = mpsc::channel();
    let handle: LinkHandle<GattEvent> = LinkHandle::new(tx, &link_config);
    let transport = SimGattTransport::new(link_config.target, peripheral.clone(), handle.events());
    let link = GattConnectionManager::new(
        transport,
        link_config.clone(),
        shared.clone(),
        connection,
        Instant::now(),
    );
    let task = LinkTask::new(link, &link_config, rx);
    let link_thread = thread::Builder::new()
        .name("link_task".into())
        .spawn(move || {
            task.run(|| {});
            info!("Link task exited");
        })?;

    let stop = Arc::new(AtomicBool::new(false));
    let session = Elm327Session::new(shared.clone(), handle.clone(), session_config);
    let mut scheduler = Scheduler::new(session, polling_config);
    let poll_thread = {
        let stop = stop.clone();
        thread::Builder::new()
            .name("obd_poll".into())
            .spawn(move || scheduler.run(&stop, || {}))?
    };
    info!("Link task and polling scheduler started, target {}", link_config.target);

    let started = Instant::now();
    let run_for = (args.duration_secs > 0).then(|| Duration::from_secs(args.duration_secs));
    let status_every = Duration::from_millis(args.status_ms.max(50));
    let mut ecu_on = Fault::new(args.ecu_on_after_secs);
    let mut link_drop = Fault::new(args.drop_after_secs);
    let mut next_status = started + status_every;

    loop {
        let elapsed = started.elapsed();
        if run_for.is_some_and(|limit| elapsed >= limit) {
            break;
        }

        {
            let mut adapter = peripheral.adapter();
            let rpm = ramp_rpm(elapsed);
            adapter.vehicle.rpm = rpm;
            adapter.vehicle.throttle_pct = throttle_for(rpm);
            if ecu_on.due(elapsed) {
                info!("🔑 Ignition on");
                adapter.vehicle.ecu_online = true;
            }
        }

        if link_drop.due(elapsed) {
            warn!("💥 Dropping the BLE link");
            peripheral.drop_link();
            let event = GattEvent::Disconnected {
                conn: CONN,
                reason: REASON_SUPERVISION_TIMEOUT,
            };
            if handle.events().send(LinkMessage::Event(event)).is_err() {
                error!("Link task gone");
            }
        }

        if Instant::now() >= next_status {
            next_status += status_every;
            let snapshot = status.snapshot();
            println!("{}", serde_json::to_string(&snapshot)?);
        }

        thread::sleep(Duration::from_millis(20));
    }

    info!("Shutting down after {:.1}s", started.elapsed().as_secs_f32());
    stop.store(true, Ordering::Relaxed);
    if let Err(e) = handle.shutdown() {
        warn!("Link shutdown: {e}");
    }
    poll_thread
        .join()
        .map_err(|_| anyhow!("Polling thread panicked"))?;
    link_thread
        .join()
        .map_err(|_| anyhow!("Link thread panicked"))?;

    let errors = shared.error_counts();
    info!(
        "Adapter handled {} commands, sent {} notifications, error counts {errors:?}",
        peripheral.adapter().commands_handled,
        peripheral.notifications_sent()
    );
    Ok(())
}
