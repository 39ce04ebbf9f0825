//! In-process ELM327 model
//!
//! Answers the command set the client emits, with responses built from an
//! adjustable [`VehicleState`]. Used by the session tests and by the host
//! simulator, which wires it behind a fake BLE transport.

use log::debug;

/// Payload bytes in a single CAN frame
const SINGLE_FRAME_BYTES: usize = 7;
/// Payload bytes in the first frame of a multi-frame reply
const FIRST_FRAME_BYTES: usize = 6;

/// What the simulated vehicle is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleState {
    pub rpm: u32,
    pub throttle_pct: u8,
    pub speed_kmh: u8,
    /// Ignition on and ECU answering on the bus
    pub ecu_online: bool,
    /// Battery voltage reported by `AT RV`
    pub battery_mv: u32,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            rpm: 800,
            throttle_pct: 0,
            speed_kmh: 0,
            ecu_online: true,
            battery_mv: 12400,
        }
    }
}

/// ELM327 settings that shape the response text
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // Independent ELM327 protocol flags
struct AdapterSettings {
    /// ATE0/ATE1
    echo: bool,
    /// ATL0/ATL1
    linefeeds: bool,
    /// ATS0/ATS1
    spaces: bool,
    /// ATH0/ATH1
    headers: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            echo: true,
            linefeeds: true,
            spaces: true,
            headers: false,
        }
    }
}

impl AdapterSettings {
    fn line_ending(&self) -> &'static str {
        if self.linefeeds {
            "\r\n"
        } else {
            "\r"
        }
    }
}

#[derive(Debug)]
pub struct SimulatedAdapter {
    pub vehicle: VehicleState,
    settings: AdapterSettings,
    pending: Vec<u8>,
    /// Emit `SEARCHING...` before the first OBD answer after a reset
    search_on_first_request: bool,
    searched: bool,
    /// Split replies longer than one CAN frame into numbered ISO-TP lines
    can_frames: bool,
    /// Number of commands answered since creation
    pub commands_handled: usize,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(VehicleState::default())
    }
}

impl SimulatedAdapter {
    pub fn new(vehicle: VehicleState) -> Self {
        Self {
            vehicle,
            settings: AdapterSettings::default(),
            pending: Vec::new(),
            search_on_first_request: false,
            searched: false,
            can_frames: false,
            commands_handled: 0,
        }
    }

    #[must_use]
    pub fn with_search_preamble(mut self) -> Self {
        self.search_on_first_request = true;
        self
    }

    #[must_use]
    pub fn with_can_frames(mut self) -> Self {
        self.can_frames = true;
        self
    }

    /// Feed bytes written by the client, returning the bytes the adapter
    /// sends back (echo included).
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &byte in data {
            if self.settings.echo {
                out.push(byte);
            }
            match byte {
                b'\r' => {
                    let command = String::from_utf8_lossy(&self.pending).trim().to_uppercase();
                    self.pending.clear();
                    if !command.is_empty() {
                        debug!("SIM RX: {command}");
                        let response = self.process_command(&command);
                        debug!("SIM TX: {}", response.escape_debug());
                        out.extend_from_slice(response.as_bytes());
                        self.commands_handled += 1;
                    }
                }
                b'\n' => {}
                _ => self.pending.push(byte),
            }
        }
        out
    }

    fn process_command(&mut self, cmd: &str) -> String {
        if cmd.starts_with("AT") {
            return self.handle_at_command(cmd);
        }

        let le = self.settings.line_ending();
        match cmd.strip_prefix("01") {
            Some(pids) if !pids.is_empty() => {
                let mut text = String::new();
                if self.search_on_first_request && !self.searched {
                    self.searched = true;
                    text.push_str("SEARCHING...");
                    text.push_str(le);
                }
                let multi_frame = |hex: &str| {
                    self.can_frames && !self.settings.headers && hex.len() > SINGLE_FRAME_BYTES * 2
                };
                match self.mode01_response(pids) {
                    Some(hex) if multi_frame(&hex) => text.push_str(&self.format_multi_frame(&hex)),
                    Some(hex) => text.push_str(&self.format_hex(&hex)),
                    None if !self.vehicle.ecu_online && pids == "00" => text.push_str("UNABLE TO CONNECT"),
                    None => text.push_str("NO DATA"),
                }
                format!("{text}{le}{le}>")
            }
            _ => format!("?{le}{le}>"),
        }
    }

    fn handle_at_command(&mut self, command: &str) -> String {
        // The client sends both `AT SP 0` and `ATSP0` forms
        let cmd: String = command.chars().filter(|c| !c.is_whitespace()).collect();
        let le = self.settings.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" | "ATWS" => {
                self.settings = AdapterSettings::default();
                self.searched = false;
                let le = self.settings.line_ending();
                return format!("{le}{le}ELM327 v1.5{le}{le}>");
            }
            "ATE0" => {
                self.settings.echo = false;
                "OK".to_string()
            }
            "ATE1" => {
                self.settings.echo = true;
                "OK".to_string()
            }
            "ATL0" => {
                self.settings.linefeeds = false;
                "OK".to_string()
            }
            "ATL1" => {
                self.settings.linefeeds = true;
                "OK".to_string()
            }
            "ATS0" => {
                self.settings.spaces = false;
                "OK".to_string()
            }
            "ATS1" => {
                self.settings.spaces = true;
                "OK".to_string()
            }
            "ATH0" => {
                self.settings.headers = false;
                "OK".to_string()
            }
            "ATH1" => {
                self.settings.headers = true;
                "OK".to_string()
            }
            "ATI" => "ELM327 v1.5".to_string(),
            "ATRV" => {
                let mv = self.vehicle.battery_mv;
                format!("{}.{}V", mv / 1000, (mv % 1000) / 100)
            }
            "ATDPN" => "A6".to_string(),
            "ATAL" | "ATCAF1" | "ATCAF0" => "OK".to_string(),
            _ if cmd.starts_with("ATSP") || cmd.starts_with("ATSH") || cmd.starts_with("ATST") => {
                "OK".to_string()
            }
            _ => "?".to_string(),
        };

        // Settings changed by this command apply from the next response on
        format!("{le}{response_text}{le}>")
    }

    /// Compact hex payload for a Mode 01 request, or `None` for NO DATA
    fn mode01_response(&self, pids: &str) -> Option<String> {
        if !self.vehicle.ecu_online || pids.len() % 2 != 0 {
            return None;
        }
        let mut response = String::from("41");
        for i in (0..pids.len()).step_by(2) {
            let pid = pids.get(i..i + 2)?;
            let data = self.pid_data(pid)?;
            response.push_str(pid);
            response.push_str(&data);
        }
        if self.settings.headers {
            Some(format!("7E8{:02X}{response}", response.len() / 2))
        } else {
            Some(response)
        }
    }

    fn pid_data(&self, pid: &str) -> Option<String> {
        let v = &self.vehicle;
        match pid {
            "00" => Some("BE3FA813".to_string()),
            "0C" => Some(format!("{:04X}", v.rpm.saturating_mul(4).min(0xFFFF))),
            "0D" => Some(format!("{:02X}", v.speed_kmh)),
            "11" => {
                let raw = (u32::from(v.throttle_pct.min(100)) * 255).div_ceil(100);
                Some(format!("{raw:02X}"))
            }
            _ => None,
        }
    }

    /// `008`, then `0:` with six payload bytes and `1:`.. with seven each,
    /// the last one padded with zeros
    fn format_multi_frame(&self, hex: &str) -> String {
        let le = self.settings.line_ending();
        let separator = if self.settings.spaces { " " } else { "" };
        let mut out = format!("{:03X}", hex.len() / 2);
        let (first, mut rest) = hex.split_at(hex.len().min(FIRST_FRAME_BYTES * 2));
        out.push_str(le);
        out.push_str(&format!("0:{separator}{}", self.format_hex(first)));
        let mut index = 1u8;
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(SINGLE_FRAME_BYTES * 2));
            let mut frame = chunk.to_string();
            while frame.len() < SINGLE_FRAME_BYTES * 2 {
                frame.push_str("00");
            }
            out.push_str(le);
            out.push_str(&format!("{index:X}:{separator}{}", self.format_hex(&frame)));
            index = (index + 1) % 0x10;
            rest = tail;
        }
        out
    }

    fn format_hex(&self, hex: &str) -> String {
        if !self.settings.spaces {
            return hex.to_string();
        }
        let mut out = String::with_capacity(hex.len() * 3 / 2);
        for (i, c) in hex.chars().enumerate() {
            if i > 0 && i % 2 == 0 {
                out.push(' ');
            }
            out.push(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::LineFramer;
    use crate::pid::{decode_mode01, PidValue};
    use crate::response::{classify, AdapterError, Response};

    fn lines(adapter: &mut SimulatedAdapter, cmd: &str) -> Vec<String> {
        let out = adapter.feed(format!("{cmd}\r").as_bytes());
        let mut framer = LineFramer::<384>::new();
        let mut lines = Vec::new();
        framer.feed(&out, |f| {
            if !f.text.is_empty() {
                lines.push(f.text.to_string());
            }
        });
        lines
    }

    #[test]
    fn test_reset_and_echo() {
        let mut adapter = SimulatedAdapter::default();
        let l = lines(&mut adapter, "ATZ");
        // Echo is on after reset
        assert_eq!(l, vec!["ATZ".to_string(), "ELM327 v1.5".to_string()]);
        let l = lines(&mut adapter, "ATE0");
        assert_eq!(l.last().map(String::as_str), Some("OK"));
        let l = lines(&mut adapter, "ATI");
        assert_eq!(l, vec!["ELM327 v1.5".to_string()]);
    }

    #[test]
    fn test_spaced_at_commands() {
        let mut adapter = SimulatedAdapter::default();
        lines(&mut adapter, "ATE0");
        for cmd in ["AT SP 0", "AT AL", "AT SH 7DF", "AT CAF1", "AT ST 32"] {
            assert_eq!(lines(&mut adapter, cmd), vec!["OK".to_string()], "{cmd}");
        }
        assert_eq!(lines(&mut adapter, "AT DPN"), vec!["A6".to_string()]);
        assert_eq!(
            classify(&lines(&mut adapter, "AT RV")[0]),
            Response::Voltage { millivolts: 12400 }
        );
        assert_eq!(lines(&mut adapter, "AT XYZ"), vec!["?".to_string()]);
    }

    #[test]
    fn test_combined_request_decodes() {
        let mut adapter = SimulatedAdapter::new(VehicleState {
            rpm: 3000,
            throttle_pct: 27,
            speed_kmh: 88,
            ..VehicleState::default()
        });
        lines(&mut adapter, "ATE0");
        let l = lines(&mut adapter, "010C110D");
        assert_eq!(l.len(), 1);
        assert_eq!(
            decode_mode01(&l[0]).as_slice(),
            &[PidValue::Rpm(3000), PidValue::Throttle(27), PidValue::Speed(88)]
        );
    }

    #[test]
    fn test_can_frames_split_long_reply() {
        let mut adapter = SimulatedAdapter::new(VehicleState {
            rpm: 3000,
            throttle_pct: 100,
            speed_kmh: 60,
            ..VehicleState::default()
        })
        .with_can_frames();
        lines(&mut adapter, "ATE0");
        assert_eq!(
            lines(&mut adapter, "010C110D"),
            vec![
                "008".to_string(),
                "0: 41 0C 2E E0 11 FF".to_string(),
                "1: 0D 3C 00 00 00 00 00".to_string()
            ]
        );
        // Short replies stay on one line
        assert_eq!(lines(&mut adapter, "010D"), vec!["41 0D 3C".to_string()]);

        lines(&mut adapter, "ATS0");
        assert_eq!(lines(&mut adapter, "010C110D")[1], "0:410C2EE011FF");
    }

    #[test]
    fn test_compact_format() {
        let mut adapter = SimulatedAdapter::default();
        lines(&mut adapter, "ATE0");
        lines(&mut adapter, "ATS0");
        lines(&mut adapter, "ATL0");
        let out = adapter.feed(b"010D\r");
        assert_eq!(out, b"410D00\r\r>");
    }

    #[test]
    fn test_ecu_offline() {
        let mut adapter = SimulatedAdapter::new(VehicleState {
            ecu_online: false,
            ..VehicleState::default()
        });
        lines(&mut adapter, "ATE0");
        assert_eq!(
            classify(&lines(&mut adapter, "0100")[0]),
            Response::Error(AdapterError::UnableToConnect)
        );
        assert_eq!(
            classify(&lines(&mut adapter, "010C")[0]),
            Response::Error(AdapterError::NoData)
        );
    }

    #[test]
    fn test_search_preamble_once_per_reset() {
        let mut adapter = SimulatedAdapter::default().with_search_preamble();
        lines(&mut adapter, "ATE0");
        let l = lines(&mut adapter, "0100");
        assert_eq!(l[0], "SEARCHING...");
        assert_eq!(l[1], "41 00 BE 3F A8 13");
        assert_eq!(lines(&mut adapter, "0100").len(), 1);
        lines(&mut adapter, "ATZ");
        lines(&mut adapter, "ATE0");
        assert_eq!(lines(&mut adapter, "0100")[0], "SEARCHING...");
    }

    #[test]
    fn test_unknown_pid_is_no_data() {
        let mut adapter = SimulatedAdapter::default();
        lines(&mut adapter, "ATE0");
        assert_eq!(lines(&mut adapter, "0105"), vec!["NO DATA".to_string()]);
        assert_eq!(lines(&mut adapter, "0902"), vec!["?".to_string()]);
    }
}
