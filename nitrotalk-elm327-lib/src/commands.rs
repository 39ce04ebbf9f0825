//! AT and OBD2 command catalog
//!
//! Commands are stored without the trailing carriage return; the session
//! engine appends it when transmitting.

use serde::{Deserialize, Serialize};

pub const RESET: &str = "ATZ";
pub const ECHO_OFF: &str = "ATE0";
pub const LINEFEEDS_OFF: &str = "ATL0";
pub const SPACES_OFF: &str = "ATS0";
pub const HEADERS_OFF: &str = "ATH0";
pub const PROTOCOL_AUTO: &str = "AT SP 0";
pub const PROTOCOL_AUTO_COMPACT: &str = "ATSP0";
pub const ALLOW_LONG_FRAMES: &str = "AT AL";
pub const BROADCAST_HEADER: &str = "AT SH 7DF";
pub const CAN_AUTO_FORMAT: &str = "AT CAF1";
/// Response timeout 0x32 * 4ms = 200ms
pub const SHORT_TIMEOUT: &str = "AT ST 32";
pub const READ_VOLTAGE: &str = "AT RV";
pub const DESCRIBE_PROTOCOL: &str = "AT DPN";

/// Mode 01 PID 00: supported PIDs 01-20, used as the ECU liveness probe
pub const SUPPORTED_PIDS: &str = "0100";
/// RPM, throttle and speed in a single request
pub const COMBINED_REQUEST: &str = "010C110D";

/// Longest command the session engine will transmit (without terminator)
pub const MAX_COMMAND_LEN: usize = 31;

/// The Mode 01 PIDs this system decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pid {
    Rpm = 0x0C,
    Speed = 0x0D,
    Throttle = 0x11,
}

impl Pid {
    /// Order of the per-PID polling cycle
    pub const CYCLE: [Pid; 3] = [Pid::Rpm, Pid::Throttle, Pid::Speed];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0C => Some(Self::Rpm),
            0x0D => Some(Self::Speed),
            0x11 => Some(Self::Throttle),
            _ => None,
        }
    }

    /// Single-PID request string
    pub const fn request(self) -> &'static str {
        match self {
            Self::Rpm => "010C",
            Self::Speed => "010D",
            Self::Throttle => "0111",
        }
    }

    /// Number of data bytes following the PID byte in a response
    pub const fn data_len(self) -> usize {
        match self {
            Self::Rpm => 2,
            Self::Speed | Self::Throttle => 1,
        }
    }
}

/// Which configured pause follows an initialization step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Regular gap between configuration commands
    Command,
    /// Adapter reboot after `ATZ`
    Reset,
    /// Voltage / protocol queries
    Diagnostic,
    /// First OBD request, the adapter may search the bus
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitStep {
    pub command: &'static str,
    pub settle: Settle,
    pub description: &'static str,
}

const fn step(command: &'static str, settle: Settle, description: &'static str) -> InitStep {
    InitStep {
        command,
        settle,
        description,
    }
}

const FULL_SEQUENCE: &[InitStep] = &[
    step(RESET, Settle::Reset, "Resetting adapter"),
    step(ECHO_OFF, Settle::Command, "Disabling echo"),
    step(PROTOCOL_AUTO, Settle::Command, "Setting auto protocol detection"),
    step(ALLOW_LONG_FRAMES, Settle::Command, "Enabling long frames"),
    step(BROADCAST_HEADER, Settle::Command, "Setting broadcast address"),
    step(CAN_AUTO_FORMAT, Settle::Command, "Enabling auto-format ISO-TP"),
    step(SHORT_TIMEOUT, Settle::Command, "Setting shorter timeout"),
    step(HEADERS_OFF, Settle::Command, "Disabling headers"),
    step(READ_VOLTAGE, Settle::Diagnostic, "Reading battery voltage"),
    step(DESCRIBE_PROTOCOL, Settle::Diagnostic, "Checking detected protocol"),
    step(SUPPORTED_PIDS, Settle::Probe, "Testing basic OBD"),
];

const COMPACT_SEQUENCE: &[InitStep] = &[
    step(RESET, Settle::Reset, "Resetting adapter"),
    step(ECHO_OFF, Settle::Command, "Disabling echo"),
    step(LINEFEEDS_OFF, Settle::Command, "Disabling linefeeds"),
    step(SPACES_OFF, Settle::Command, "Disabling spaces"),
    step(HEADERS_OFF, Settle::Command, "Disabling headers"),
    step(PROTOCOL_AUTO_COMPACT, Settle::Command, "Setting auto protocol detection"),
    step(READ_VOLTAGE, Settle::Diagnostic, "Reading battery voltage"),
    step(DESCRIBE_PROTOCOL, Settle::Diagnostic, "Checking detected protocol"),
    step(SUPPORTED_PIDS, Settle::Probe, "Testing basic OBD"),
];

/// Adapter configuration sequence run after every link establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitProfile {
    /// CAN-oriented sequence used over BLE
    #[default]
    Full,
    /// Short sequence used by Classic SPP adapters
    Compact,
}

impl InitProfile {
    pub const fn steps(self) -> &'static [InitStep] {
        match self {
            Self::Full => FULL_SEQUENCE,
            Self::Compact => COMPACT_SEQUENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_codes_round_trip() {
        for pid in Pid::CYCLE {
            assert_eq!(Pid::from_code(pid.code()), Some(pid));
        }
        assert_eq!(Pid::from_code(0x05), None);
    }

    #[test]
    fn test_requests_match_codes() {
        for pid in Pid::CYCLE {
            assert_eq!(pid.request(), format!("01{:02X}", pid.code()));
        }
    }

    #[test]
    fn test_full_profile_order() {
        let commands: Vec<_> = InitProfile::Full.steps().iter().map(|s| s.command).collect();
        assert_eq!(commands.first(), Some(&"ATZ"));
        assert_eq!(commands.last(), Some(&"0100"));
        let pos = |c: &str| commands.iter().position(|x| *x == c).unwrap();
        assert!(pos("ATE0") < pos("AT SP 0"));
        assert!(pos("AT CAF1") < pos("ATH0"));
        assert!(pos("ATH0") < pos("AT RV"));
        assert!(pos("AT RV") < pos("AT DPN"));
    }

    #[test]
    fn test_commands_fit_limit() {
        for profile in [InitProfile::Full, InitProfile::Compact] {
            for s in profile.steps() {
                assert!(s.command.len() <= MAX_COMMAND_LEN);
            }
        }
        assert!(COMBINED_REQUEST.len() <= MAX_COMMAND_LEN);
    }
}
