//! Mode 01 response decoding
//!
//! Handles single and combined responses, spaced (`41 0C 0B B8`) or compact
//! (`410C0BB8`) hex, and an optional ISO-TP line number prefix (`0:`).
//! Multiple `41` markers on one line (an adapter concatenating ECU replies)
//! each start a new run of PID/data groups.

use log::trace;
use smallvec::SmallVec;

use crate::commands::Pid;
use crate::multiframe::strip_line_number;

const MODE01_ACK: u8 = 0x41;

/// A decoded telemetry value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidValue {
    Rpm(u32),
    Speed(u8),
    /// Percent, 0-100
    Throttle(u8),
}

impl PidValue {
    pub const fn pid(self) -> Pid {
        match self {
            Self::Rpm(_) => Pid::Rpm,
            Self::Speed(_) => Pid::Speed,
            Self::Throttle(_) => Pid::Throttle,
        }
    }

    fn decode(pid: Pid, data: &[u8]) -> Self {
        match pid {
            Pid::Rpm => Self::Rpm((u32::from(data[0]) * 256 + u32::from(data[1])) / 4),
            Pid::Speed => Self::Speed(data[0]),
            // 255 * 100 / 255 = 100, so the cast cannot truncate
            #[allow(clippy::cast_possible_truncation)]
            Pid::Throttle => Self::Throttle((u16::from(data[0]) * 100 / 255) as u8),
        }
    }
}

pub type PidValues = SmallVec<[PidValue; 4]>;

const fn is_filler(byte: u8) -> bool {
    matches!(byte, 0x00 | 0x55 | 0xAA)
}

/// Decode a response line into telemetry values
///
/// Returns an empty list for anything that is not a Mode 01 response: error
/// tokens, AT replies, lines with non-hex text. That is not an error, just
/// chatter the caller can ignore.
pub fn decode_mode01(line: &str) -> PidValues {
    let mut values = PidValues::new();

    let body = strip_line_number(line.trim());
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_hexdigit() || c.is_ascii_whitespace()) {
        return values;
    }
    let digits: String = body.chars().filter(char::is_ascii_hexdigit).collect();
    let Ok(bytes) = hex::decode(&digits) else {
        trace!("Odd-length hex payload: {digits}");
        return values;
    };

    if bytes.first() != Some(&MODE01_ACK) {
        return values;
    }

    let mut i = 1;
    while let Some(&code) = bytes.get(i) {
        if code == MODE01_ACK {
            i += 1;
            continue;
        }
        if is_filler(code) {
            break;
        }
        let Some(pid) = Pid::from_code(code) else {
            // Unknown PID: assume a single data byte and keep going
            trace!("Skipping unknown PID 0x{code:02X}");
            i += 2;
            continue;
        };
        let end = i + 1 + pid.data_len();
        let Some(data) = bytes.get(i + 1..end) else {
            trace!("Truncated data for PID 0x{code:02X}");
            break;
        };
        values.push(PidValue::decode(pid, data));
        i = end;
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rpm() {
        assert_eq!(decode_mode01("41 0C 1A F8").as_slice(), &[PidValue::Rpm(1726)]);
        assert_eq!(decode_mode01("410C1AF8").as_slice(), &[PidValue::Rpm(1726)]);
    }

    #[test]
    fn test_rpm_3000() {
        assert_eq!(decode_mode01("41 0C 2E E0").as_slice(), &[PidValue::Rpm(3000)]);
    }

    #[test]
    fn test_throttle_and_speed() {
        assert_eq!(decode_mode01("41 11 FF").as_slice(), &[PidValue::Throttle(100)]);
        assert_eq!(decode_mode01("41 11 80").as_slice(), &[PidValue::Throttle(50)]);
        assert_eq!(decode_mode01("41 0D 3C").as_slice(), &[PidValue::Speed(60)]);
    }

    #[test]
    fn test_combined_single_marker() {
        let values = decode_mode01("41 0C 0B B8 11 FF 0D 3C");
        assert_eq!(
            values.as_slice(),
            &[PidValue::Rpm(750), PidValue::Throttle(100), PidValue::Speed(60)]
        );
    }

    #[test]
    fn test_repeated_markers() {
        let values = decode_mode01("41 0C 0B B8 41 0D 3C 41 11 FF");
        assert_eq!(
            values.as_slice(),
            &[PidValue::Rpm(750), PidValue::Speed(60), PidValue::Throttle(100)]
        );
    }

    #[test]
    fn test_line_number_prefix() {
        assert_eq!(decode_mode01("0: 41 0C 2E E0").as_slice(), &[PidValue::Rpm(3000)]);
        assert_eq!(decode_mode01("1:410D3C").as_slice(), &[PidValue::Speed(60)]);
        assert_eq!(decode_mode01("B: 41 11 FF").as_slice(), &[PidValue::Throttle(100)]);
    }

    #[test]
    fn test_filler_stops_decoding() {
        let values = decode_mode01("41 0D 3C 00 00 00");
        assert_eq!(values.as_slice(), &[PidValue::Speed(60)]);
        let values = decode_mode01("41 0D 3C AA 0C 0B B8");
        assert_eq!(values.as_slice(), &[PidValue::Speed(60)]);
    }

    #[test]
    fn test_unknown_pid_skipped() {
        // PID 05 (coolant) has one data byte
        let values = decode_mode01("41 05 7B 0D 3C");
        assert_eq!(values.as_slice(), &[PidValue::Speed(60)]);
    }

    #[test]
    fn test_truncated_data() {
        assert!(decode_mode01("41 0C 0B").is_empty());
        let values = decode_mode01("41 0D 3C 0C 0B");
        assert_eq!(values.as_slice(), &[PidValue::Speed(60)]);
    }

    #[test]
    fn test_ignores_non_mode01() {
        assert!(decode_mode01("NO DATA").is_empty());
        assert!(decode_mode01("ELM327 v1.5").is_empty());
        assert!(decode_mode01("7E8 03 41 0C").is_empty());
        assert!(decode_mode01("").is_empty());
        assert!(decode_mode01("41 0").is_empty());
    }

    #[test]
    fn test_supported_pids_probe_yields_nothing() {
        // PID 00 sits in filler position, the bitmap is not telemetry
        assert!(decode_mode01("41 00 BE 3E B8 11").is_empty());
    }
}
