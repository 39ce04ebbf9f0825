use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{debug, info, warn, LevelFilter};
use nitrotalk_link_lib::{BdAddr, LinkConfig};
use nitrotalk_obd_lib::{PollingConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

const NVS_NAMESPACE: &str = "nitrotalk";
const NVS_CONFIG_KEY: &str = "config";
/// Auto-injection mode flag, written by the injection controller
const NVS_AUTO_INJECTION_KEY: &str = "auto_inj";

/// Shortest allowed status log period (ms)
const MIN_STATUS_INTERVAL_MS: u64 = 250;

// Global NVS handle - initialized once in main
static NVS: Mutex<Option<EspNvs<NvsDefault>>> = Mutex::new(None);

pub fn init_nvs(nvs_partition: EspNvsPartition<NvsDefault>) -> Result<()> {
    debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
    let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
    *NVS.lock().unwrap_or_else(PoisonError::into_inner) = Some(nvs);
    info!("NVS initialized");
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_link")]
    pub link: LinkConfig,
    #[serde(default = "default_session")]
    pub session: SessionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Raise the Bluedroid stack's own log tags to debug
    #[serde(default)]
    pub bt_stack_logs: bool,
    /// Period of the status log line (ms)
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

/// The Classic adapter sits at its own address and wants the compact profile
fn default_link() -> LinkConfig {
    if cfg!(feature = "classic") {
        LinkConfig {
            target: BdAddr([0x01, 0x23, 0x45, 0x67, 0x89, 0xBA]),
            ..LinkConfig::default()
        }
    } else {
        LinkConfig::default()
    }
}

fn default_session() -> SessionConfig {
    if cfg!(feature = "classic") {
        SessionConfig {
            init_profile: nitrotalk_elm327_lib::InitProfile::Compact,
            ..SessionConfig::default()
        }
    } else {
        SessionConfig::default()
    }
}

const fn default_status_interval_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: default_link(),
            session: default_session(),
            polling: PollingConfig::default(),
            log_level: LogLevel::default(),
            bt_stack_logs: false,
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

impl Config {
    /// Clamp out-of-range values after loading
    pub fn validate(&mut self) {
        self.link.validate();
        self.session.validate();
        self.polling.validate();
        if self.status_interval_ms < MIN_STATUS_INTERVAL_MS {
            warn!(
                "Clamping status_interval_ms from {} to {MIN_STATUS_INTERVAL_MS}",
                self.status_interval_ms
            );
            self.status_interval_ms = MIN_STATUS_INTERVAL_MS;
        }
    }

    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(mut config) => {
                info!("Loaded config from NVS");
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from NVS: {e}, using defaults");
                let config = Self::default();
                // First boot: persist the defaults so they can be edited in place
                if let Err(e) = config.save() {
                    warn!("Failed to save default config: {e}");
                }
                config
            }
        }
    }

    pub fn load() -> Result<Self> {
        debug!("Loading config from NVS");
        let nvs_guard = NVS.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = nvs_guard.as_ref().ok_or_else(|| anyhow!("NVS not initialized"))?;

        let len = nvs.blob_len(NVS_CONFIG_KEY)?;
        if let Some(len) = len {
            debug!("Config blob size: {len} bytes");
            let mut buf = vec![0u8; len];
            nvs.get_blob(NVS_CONFIG_KEY, &mut buf)?;
            let config: Config = serde_json::from_slice(&buf)?;
            debug!(
                "Config parsed: target={}, profile={:?}, log_level={:?}",
                config.link.target, config.session.init_profile, config.log_level
            );
            Ok(config)
        } else {
            Err(anyhow!("No config found in NVS"))
        }
    }

    pub fn save(&self) -> Result<()> {
        debug!("Saving config to NVS");
        let mut nvs_guard = NVS.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = nvs_guard.as_mut().ok_or_else(|| anyhow!("NVS not initialized"))?;

        let json = serde_json::to_vec(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        nvs.set_blob(NVS_CONFIG_KEY, &json)?;
        info!("Config saved to NVS");
        Ok(())
    }
}

/// Persisted auto-injection mode; off when never written
pub fn load_auto_injection() -> bool {
    let nvs_guard = NVS.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(nvs) = nvs_guard.as_ref() else {
        return false;
    };
    match nvs.get_u8(NVS_AUTO_INJECTION_KEY) {
        Ok(value) => value.is_some_and(|v| v != 0),
        Err(e) => {
            warn!("Failed to read {NVS_AUTO_INJECTION_KEY}: {e}");
            false
        }
    }
}
