use std::time::Duration;

use log::warn;
use nitrotalk_elm327_lib::{InitProfile, Settle};
use serde::{Deserialize, Serialize};

/// Session engine timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub init_profile: InitProfile,
    /// Longest wait for the `>` prompt before sending anyway (ms)
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,
    /// Pause between link establishment and the first command (ms)
    #[serde(default = "default_post_connect_settle_ms")]
    pub post_connect_settle_ms: u64,
    /// Pause after each configuration command (ms)
    #[serde(default = "default_command_settle_ms")]
    pub command_settle_ms: u64,
    /// Pause after `ATZ` while the adapter reboots (ms)
    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,
    #[serde(default = "default_diagnostic_settle_ms")]
    pub diagnostic_settle_ms: u64,
    #[serde(default = "default_probe_settle_ms")]
    pub probe_settle_ms: u64,
    /// Consecutive `SEARCHING...` lines before the last command is re-issued
    #[serde(default = "default_search_stall_threshold")]
    pub search_stall_threshold: u32,
    #[serde(default = "default_search_retry_wait_ms")]
    pub search_retry_wait_ms: u64,
    /// How long one ECU probe waits for an answer (ms)
    #[serde(default = "default_ecu_probe_timeout_ms")]
    pub ecu_probe_timeout_ms: u64,
    #[serde(default = "default_ecu_probe_retries")]
    pub ecu_probe_retries: u32,
    #[serde(default = "default_ecu_probe_pause_ms")]
    pub ecu_probe_pause_ms: u64,
}

const fn default_prompt_timeout_ms() -> u64 {
    2000
}

const fn default_post_connect_settle_ms() -> u64 {
    3000
}

const fn default_command_settle_ms() -> u64 {
    500
}

const fn default_reset_settle_ms() -> u64 {
    3000
}

const fn default_diagnostic_settle_ms() -> u64 {
    1000
}

const fn default_probe_settle_ms() -> u64 {
    2000
}

const fn default_search_stall_threshold() -> u32 {
    3
}

const fn default_search_retry_wait_ms() -> u64 {
    500
}

const fn default_ecu_probe_timeout_ms() -> u64 {
    4000
}

const fn default_ecu_probe_retries() -> u32 {
    3
}

const fn default_ecu_probe_pause_ms() -> u64 {
    2000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_profile: InitProfile::default(),
            prompt_timeout_ms: default_prompt_timeout_ms(),
            post_connect_settle_ms: default_post_connect_settle_ms(),
            command_settle_ms: default_command_settle_ms(),
            reset_settle_ms: default_reset_settle_ms(),
            diagnostic_settle_ms: default_diagnostic_settle_ms(),
            probe_settle_ms: default_probe_settle_ms(),
            search_stall_threshold: default_search_stall_threshold(),
            search_retry_wait_ms: default_search_retry_wait_ms(),
            ecu_probe_timeout_ms: default_ecu_probe_timeout_ms(),
            ecu_probe_retries: default_ecu_probe_retries(),
            ecu_probe_pause_ms: default_ecu_probe_pause_ms(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&mut self) {
        if self.search_stall_threshold == 0 {
            warn!("search_stall_threshold is 0, clamping to 1");
            self.search_stall_threshold = 1;
        }
        if self.ecu_probe_retries == 0 {
            warn!("ecu_probe_retries is 0, clamping to 1");
            self.ecu_probe_retries = 1;
        }
        if self.prompt_timeout_ms == 0 {
            warn!("prompt_timeout_ms is 0, resetting to {}", default_prompt_timeout_ms());
            self.prompt_timeout_ms = default_prompt_timeout_ms();
        }
    }

    pub fn settle(&self, settle: Settle) -> Duration {
        Duration::from_millis(match settle {
            Settle::Command => self.command_settle_ms,
            Settle::Reset => self.reset_settle_ms,
            Settle::Diagnostic => self.diagnostic_settle_ms,
            Settle::Probe => self.probe_settle_ms,
        })
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }
}

/// Polling scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Delay decrease after a decoded response (ms)
    #[serde(default = "default_step_down_ms")]
    pub step_down_ms: u64,
    /// Delay increase after a failed round trip (ms)
    #[serde(default = "default_step_up_ms")]
    pub step_up_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Consecutive failures at the delay ceiling that declare the ECU lost
    #[serde(default = "default_ceiling_failure_threshold")]
    pub ceiling_failure_threshold: u32,
    /// Time without a decode before combined requests give way to per-PID (ms)
    #[serde(default = "default_stall_window_ms")]
    pub stall_window_ms: u64,
    /// Successful per-PID cycles before switching back to combined requests
    #[serde(default = "default_recover_cycles")]
    pub recover_cycles: u32,
    #[serde(default = "default_stale_combined_ms")]
    pub stale_combined_ms: u64,
    #[serde(default = "default_stale_per_pid_ms")]
    pub stale_per_pid_ms: u64,
    /// Probe rounds before the ECU is reported unreachable
    #[serde(default = "default_probe_rounds")]
    pub probe_rounds: u32,
    #[serde(default = "default_probe_round_delay_ms")]
    pub probe_round_delay_ms: u64,
}

const fn default_min_delay_ms() -> u64 {
    50
}

const fn default_max_delay_ms() -> u64 {
    1000
}

const fn default_step_down_ms() -> u64 {
    10
}

const fn default_step_up_ms() -> u64 {
    100
}

const fn default_response_timeout_ms() -> u64 {
    1000
}

const fn default_ceiling_failure_threshold() -> u32 {
    3
}

const fn default_stall_window_ms() -> u64 {
    3000
}

const fn default_recover_cycles() -> u32 {
    5
}

const fn default_stale_combined_ms() -> u64 {
    2000
}

const fn default_stale_per_pid_ms() -> u64 {
    4000
}

const fn default_probe_rounds() -> u32 {
    30
}

const fn default_probe_round_delay_ms() -> u64 {
    2000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            step_down_ms: default_step_down_ms(),
            step_up_ms: default_step_up_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            ceiling_failure_threshold: default_ceiling_failure_threshold(),
            stall_window_ms: default_stall_window_ms(),
            recover_cycles: default_recover_cycles(),
            stale_combined_ms: default_stale_combined_ms(),
            stale_per_pid_ms: default_stale_per_pid_ms(),
            probe_rounds: default_probe_rounds(),
            probe_round_delay_ms: default_probe_round_delay_ms(),
        }
    }
}

impl PollingConfig {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.min_delay_ms > self.max_delay_ms {
            warn!(
                "Clamping min_delay_ms from {} to max_delay_ms {}",
                self.min_delay_ms, self.max_delay_ms
            );
            self.min_delay_ms = self.max_delay_ms;
        }
        if self.step_up_ms == 0 {
            // The delay has to climb to the ceiling before failures count
            warn!("step_up_ms is 0, clamping to 1");
            self.step_up_ms = 1;
        }
        if self.ceiling_failure_threshold == 0 {
            warn!("ceiling_failure_threshold is 0, clamping to 1");
            self.ceiling_failure_threshold = 1;
        }
        if self.recover_cycles == 0 {
            warn!("recover_cycles is 0, clamping to 1");
            self.recover_cycles = 1;
        }
        if self.probe_rounds == 0 {
            warn!("probe_rounds is 0, clamping to 1");
            self.probe_rounds = 1;
        }
        if self.response_timeout_ms == 0 {
            warn!("response_timeout_ms is 0, resetting to {}", default_response_timeout_ms());
            self.response_timeout_ms = default_response_timeout_ms();
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn probe_round_delay(&self) -> Duration {
        Duration::from_millis(self.probe_round_delay_ms)
    }
}
