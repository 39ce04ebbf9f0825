//! Polling Controller: request cadence and request strategy
//!
//! Adjusted once per command round trip. The delay always stays within
//! `[min, max]`; failures at the ceiling are the only thing that can declare
//! the ECU lost.

use std::time::{Duration, Instant};

use atomic_enum::atomic_enum;
use log::{debug, info, warn};
use nitrotalk_elm327_lib::commands::COMBINED_REQUEST;
use nitrotalk_elm327_lib::Pid;
use serde::Serialize;

use crate::config::PollingConfig;

#[atomic_enum]
#[derive(PartialEq, Eq, Serialize)]
pub enum PollMode {
    /// One `010C110D` request for all three PIDs
    Combined = 0,
    /// RPM, throttle and speed requested one at a time
    PerPid,
}

/// How one command round trip went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTrip {
    /// A telemetry field was updated
    Success,
    /// The adapter answered, but nothing decoded
    SoftFailure,
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    EcuLost,
}

#[derive(Debug)]
pub struct PollingController {
    min: Duration,
    max: Duration,
    step_down: Duration,
    step_up: Duration,
    threshold: u32,
    stall_window: Duration,
    recover_cycles: u32,
    stale_combined: Duration,
    stale_per_pid: Duration,

    current_delay: Duration,
    consecutive_error_count: u32,
    mode: PollMode,
    cycles_in_mode: u32,
    last_success: Instant,
    next_pid: usize,
    cycle_had_success: bool,
}

impl PollingController {
    pub fn new(config: &PollingConfig, now: Instant) -> Self {
        let max = Duration::from_millis(config.max_delay_ms);
        let min = Duration::from_millis(config.min_delay_ms).min(max);
        Self {
            min,
            max,
            step_down: Duration::from_millis(config.step_down_ms),
            step_up: Duration::from_millis(config.step_up_ms.max(1)),
            threshold: config.ceiling_failure_threshold.max(1),
            stall_window: Duration::from_millis(config.stall_window_ms),
            recover_cycles: config.recover_cycles.max(1),
            stale_combined: Duration::from_millis(config.stale_combined_ms),
            stale_per_pid: Duration::from_millis(config.stale_per_pid_ms),
            current_delay: min,
            consecutive_error_count: 0,
            mode: PollMode::Combined,
            cycles_in_mode: 0,
            last_success: now,
            next_pid: 0,
            cycle_had_success: false,
        }
    }

    /// Back to the fastest cadence in combined mode, as after a fresh ECU
    /// verification
    pub fn reset(&mut self, now: Instant) {
        self.current_delay = self.min;
        self.consecutive_error_count = 0;
        self.mode = PollMode::Combined;
        self.cycles_in_mode = 0;
        self.last_success = now;
        self.next_pid = 0;
        self.cycle_had_success = false;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_error_count
    }

    /// Freshness limit for displayed telemetry; a per-PID cycle takes longer
    pub fn staleness_timeout(&self) -> Duration {
        match self.mode {
            PollMode::Combined => self.stale_combined,
            PollMode::PerPid => self.stale_per_pid,
        }
    }

    /// The command to send next
    pub fn next_request(&mut self) -> &'static str {
        match self.mode {
            PollMode::Combined => COMBINED_REQUEST,
            PollMode::PerPid => {
                let pid = Pid::CYCLE[self.next_pid];
                self.next_pid = (self.next_pid + 1) % Pid::CYCLE.len();
                pid.request()
            }
        }
    }

    pub fn record(&mut self, outcome: RoundTrip, now: Instant) -> Verdict {
        match outcome {
            RoundTrip::Success => {
                self.current_delay = self.current_delay.saturating_sub(self.step_down).max(self.min);
                self.consecutive_error_count = 0;
                self.last_success = now;
                self.cycle_had_success = true;
            }
            RoundTrip::SoftFailure | RoundTrip::NoResponse => {
                if self.current_delay >= self.max {
                    self.consecutive_error_count += 1;
                    debug!(
                        "{outcome:?} at delay ceiling ({}/{})",
                        self.consecutive_error_count, self.threshold
                    );
                    if self.consecutive_error_count >= self.threshold {
                        warn!(
                            "{} consecutive failures at {:?}, ECU considered lost",
                            self.consecutive_error_count, self.max
                        );
                        return Verdict::EcuLost;
                    }
                } else {
                    self.current_delay = (self.current_delay + self.step_up).min(self.max);
                }
            }
        }

        match self.mode {
            PollMode::Combined => {
                if now.saturating_duration_since(self.last_success) > self.stall_window {
                    info!("No data for {:?}, switching to per-PID requests", self.stall_window);
                    self.mode = PollMode::PerPid;
                    self.cycles_in_mode = 0;
                    self.next_pid = 0;
                    self.cycle_had_success = false;
                }
            }
            PollMode::PerPid => {
                // next_pid wrapped: a full cycle just completed
                if self.next_pid == 0 {
                    if self.cycle_had_success {
                        self.cycles_in_mode += 1;
                    } else {
                        self.cycles_in_mode = 0;
                    }
                    self.cycle_had_success = false;
                    if self.cycles_in_mode >= self.recover_cycles {
                        info!(
                            "{} good per-PID cycles, back to combined requests",
                            self.cycles_in_mode
                        );
                        self.mode = PollMode::Combined;
                        self.cycles_in_mode = 0;
                        self.last_success = now;
                    }
                }
            }
        }
        Verdict::Continue
    }
}
