use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::BdAddr;

/// How notifications are switched on once the CCCD is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NotifyStrategy {
    /// Write the enable value once
    Single,
    /// Enable, disable, wait, enable again. Some adapter firmware only starts
    /// notifying after this round trip.
    Toggle { wait_ms: u64 },
}

impl Default for NotifyStrategy {
    fn default() -> Self {
        Self::Toggle { wait_ms: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Address of the adapter to connect to
    #[serde(default = "default_target")]
    pub target: BdAddr,
    /// Length of one scan/inquiry (seconds)
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u32,
    /// Extra time past the scan duration before the supervisor stops a scan (ms)
    #[serde(default = "default_scan_grace_ms")]
    pub scan_grace_ms: u64,
    /// Pause before rescanning after a fruitless scan (ms)
    #[serde(default = "default_rescan_delay_ms")]
    pub rescan_delay_ms: u64,
    /// Idle watchdog period (ms)
    #[serde(default = "default_idle_check_ms")]
    pub idle_check_ms: u64,
    /// Time a connection attempt may stay in progress before it counts as stuck (ms)
    #[serde(default = "default_stuck_connect_ms")]
    pub stuck_connect_ms: u64,
    /// Stuck detections before the manager is hard reset instead of just disconnected
    #[serde(default = "default_hard_reset_after")]
    pub hard_reset_after: u32,
    /// Repeated failures with the same signature inside this window back off (ms)
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// MTU requested after connecting (best effort)
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub notify: NotifyStrategy,
    #[serde(default = "default_rfcomm_primary")]
    pub rfcomm_primary_channel: u8,
    #[serde(default = "default_rfcomm_fallback")]
    pub rfcomm_fallback_channel: u8,
    /// How long a caller waits for the link task to accept a write (ms)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Link task loop period (ms)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_target() -> BdAddr {
    BdAddr([0x66, 0x1E, 0x87, 0x02, 0x64, 0xC1])
}

const fn default_scan_duration_secs() -> u32 {
    30
}

const fn default_scan_grace_ms() -> u64 {
    2000
}

const fn default_rescan_delay_ms() -> u64 {
    5000
}

const fn default_idle_check_ms() -> u64 {
    10_000
}

const fn default_stuck_connect_ms() -> u64 {
    15_000
}

const fn default_hard_reset_after() -> u32 {
    2
}

const fn default_failure_window_ms() -> u64 {
    10_000
}

const fn default_backoff_base_ms() -> u64 {
    1000
}

const fn default_backoff_max_ms() -> u64 {
    60_000
}

const fn default_mtu() -> u16 {
    185
}

const fn default_rfcomm_primary() -> u8 {
    2
}

const fn default_rfcomm_fallback() -> u8 {
    1
}

const fn default_write_timeout_ms() -> u64 {
    1000
}

const fn default_tick_ms() -> u64 {
    50
}

const MAX_RFCOMM_CHANNEL: u8 = 30;
const MIN_MTU: u16 = 23;
const MAX_MTU: u16 = 517;

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            scan_duration_secs: default_scan_duration_secs(),
            scan_grace_ms: default_scan_grace_ms(),
            rescan_delay_ms: default_rescan_delay_ms(),
            idle_check_ms: default_idle_check_ms(),
            stuck_connect_ms: default_stuck_connect_ms(),
            hard_reset_after: default_hard_reset_after(),
            failure_window_ms: default_failure_window_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            mtu: default_mtu(),
            notify: NotifyStrategy::default(),
            rfcomm_primary_channel: default_rfcomm_primary(),
            rfcomm_fallback_channel: default_rfcomm_fallback(),
            write_timeout_ms: default_write_timeout_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl LinkConfig {
    pub fn validate(&mut self) {
        if self.scan_duration_secs == 0 {
            warn!("scan_duration_secs is 0, resetting to {}", default_scan_duration_secs());
            self.scan_duration_secs = default_scan_duration_secs();
        }
        if self.hard_reset_after == 0 {
            warn!("hard_reset_after is 0, clamping to 1");
            self.hard_reset_after = 1;
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            warn!(
                "Clamping backoff_base_ms from {} to backoff_max_ms {}",
                self.backoff_base_ms, self.backoff_max_ms
            );
            self.backoff_base_ms = self.backoff_max_ms;
        }
        let mtu = self.mtu.clamp(MIN_MTU, MAX_MTU);
        if mtu != self.mtu {
            warn!("Clamping mtu from {} to {mtu}", self.mtu);
            self.mtu = mtu;
        }
        for channel in [&mut self.rfcomm_primary_channel, &mut self.rfcomm_fallback_channel] {
            if *channel == 0 || *channel > MAX_RFCOMM_CHANNEL {
                warn!("RFCOMM channel {channel} out of range, clamping");
                *channel = (*channel).clamp(1, MAX_RFCOMM_CHANNEL);
            }
        }
        if self.tick_ms == 0 {
            warn!("tick_ms is 0, resetting to {}", default_tick_ms());
            self.tick_ms = default_tick_ms();
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.scan_duration_secs))
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }

    pub fn notify_wait(&self) -> Option<Duration> {
        match self.notify {
            NotifyStrategy::Single => None,
            NotifyStrategy::Toggle { wait_ms } => Some(Duration::from_millis(wait_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: LinkConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.target.to_string(), "66:1E:87:02:64:C1");
        assert_eq!(config.scan_duration_secs, 30);
        assert_eq!(config.mtu, 185);
        assert_eq!(config.notify, NotifyStrategy::Toggle { wait_ms: 200 });
        assert_eq!(config.rfcomm_primary_channel, 2);
        assert_eq!(config.rfcomm_fallback_channel, 1);
    }

    #[test]
    fn test_notify_strategy_json() {
        let config: LinkConfig = serde_json::from_str(r#"{"notify":{"mode":"single"}}"#).unwrap();
        assert_eq!(config.notify, NotifyStrategy::Single);
        assert_eq!(config.notify_wait(), None);
        let config: LinkConfig =
            serde_json::from_str(r#"{"notify":{"mode":"toggle","wait_ms":350}}"#).unwrap();
        assert_eq!(config.notify_wait(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = LinkConfig {
            mtu: 9000,
            hard_reset_after: 0,
            backoff_base_ms: 120_000,
            rfcomm_primary_channel: 0,
            ..LinkConfig::default()
        };
        config.validate();
        assert_eq!(config.mtu, 517);
        assert_eq!(config.hard_reset_after, 1);
        assert_eq!(config.backoff_base_ms, config.backoff_max_ms);
        assert_eq!(config.rfcomm_primary_channel, 1);
    }
}
