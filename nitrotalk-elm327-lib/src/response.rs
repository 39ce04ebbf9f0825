//! Classification of completed response lines

use std::fmt;

use crate::multiframe::strip_line_number;

/// Error tokens the adapter reports in place of data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterError {
    NoData,
    CanError,
    UnableToConnect,
    BusError,
    BufferFull,
    Stopped,
    /// Bare `ERROR` or `?`
    Other,
}

impl AdapterError {
    /// The adapter reached the bus but the ECU did not (or could not) answer
    pub const fn is_ecu_negative(self) -> bool {
        matches!(self, Self::NoData | Self::CanError | Self::UnableToConnect)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoData => "NO DATA",
            Self::CanError => "CAN ERROR",
            Self::UnableToConnect => "UNABLE TO CONNECT",
            Self::BusError => "BUS ERROR",
            Self::BufferFull => "BUFFER FULL",
            Self::Stopped => "STOPPED",
            Self::Other => "ERROR",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// Nothing but whitespace
    Empty,
    /// `ELM327 v1.5` banner
    Identification(&'a str),
    Ok,
    /// `SEARCHING...` while the adapter probes bus protocols
    Searching,
    Error(AdapterError),
    /// `AT RV` reply
    Voltage { millivolts: u32 },
    /// Anything else: candidate OBD data or chatter such as a protocol number
    Data(&'a str),
}

const ERROR_TOKENS: &[(&str, AdapterError)] = &[
    ("NO DATA", AdapterError::NoData),
    ("CAN ERROR", AdapterError::CanError),
    ("UNABLE TO CONNECT", AdapterError::UnableToConnect),
    ("BUS ERROR", AdapterError::BusError),
    ("BUS BUSY", AdapterError::BusError),
    ("BUFFER FULL", AdapterError::BufferFull),
    ("STOPPED", AdapterError::Stopped),
];

/// Classify one line of adapter output
pub fn classify(line: &str) -> Response<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Response::Empty;
    }
    if line.contains("ELM327") {
        return Response::Identification(line);
    }
    if line.contains("OK") {
        return Response::Ok;
    }
    if let Some(&(_, kind)) = ERROR_TOKENS.iter().find(|(token, _)| line.contains(token)) {
        return Response::Error(kind);
    }
    if line.contains("ERROR") || line == "?" {
        return Response::Error(AdapterError::Other);
    }
    if line.contains("SEARCHING") {
        return Response::Searching;
    }
    if let Some(millivolts) = parse_voltage(line) {
        return Response::Voltage { millivolts };
    }
    Response::Data(line)
}

/// Whether the line carries a Mode 01 acknowledgment (`41`), spaced or compact
pub fn starts_with_mode01_ack(line: &str) -> bool {
    let body = strip_line_number(line.trim_start()).trim_start();
    body.starts_with("41")
}

/// `12.4V` -> 12400
fn parse_voltage(line: &str) -> Option<u32> {
    let number = line.strip_suffix(['V', 'v'])?.trim();
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() || frac.len() > 3 {
        return None;
    }
    let whole: u32 = whole.parse().ok()?;
    let frac_mv = if frac.is_empty() {
        0
    } else {
        let digits: u32 = frac.parse().ok()?;
        digits * 10u32.pow(3 - frac.len() as u32)
    };
    whole.checked_mul(1000)?.checked_add(frac_mv)
}
