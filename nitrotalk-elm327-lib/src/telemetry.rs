//! Vehicle Telemetry Snapshot

use std::fmt;
use std::time::{Duration, Instant};

use enumset::{EnumSet, EnumSetType};
use log::debug;
use serde::Serialize;

use crate::pid::PidValue;

#[derive(EnumSetType, Debug)]
pub enum Field {
    Rpm,
    Throttle,
    Speed,
}

/// A value and when it was last decoded. `updated` is `None` until the first
/// decode and again after the field goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reading<T> {
    pub value: T,
    pub updated: Option<Instant>,
}

impl<T: Copy + Default> Reading<T> {
    fn set(&mut self, value: T, now: Instant) {
        self.value = value;
        self.updated = Some(now);
    }

    fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        self.updated
            .is_some_and(|at| now.saturating_duration_since(at) > max_age)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Telemetry {
    pub rpm: Reading<u32>,
    pub throttle_pct: Reading<u8>,
    pub speed_kmh: Reading<u8>,
}

/// Plain values, for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TelemetryValues {
    pub rpm: u32,
    pub throttle_pct: u8,
    pub speed_kmh: u8,
}

impl TelemetryValues {
    pub fn gear(&self) -> Gear {
        Gear::from_speed(self.speed_kmh)
    }
}

/// Gear guessed from road speed alone, in 20 km/h bands. There is no
/// standard PID for the selected gear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gear {
    #[serde(rename = "N")]
    Neutral,
    #[serde(rename = "1")]
    First,
    #[serde(rename = "2")]
    Second,
    #[serde(rename = "3")]
    Third,
    #[serde(rename = "4")]
    Fourth,
    /// Fifth or higher
    #[serde(rename = "5+")]
    Top,
}

impl Gear {
    pub const fn from_speed(speed_kmh: u8) -> Self {
        match speed_kmh {
            0 => Self::Neutral,
            1..=19 => Self::First,
            20..=39 => Self::Second,
            40..=59 => Self::Third,
            60..=79 => Self::Fourth,
            _ => Self::Top,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Neutral => "N",
            Self::First => "1",
            Self::Second => "2",
            Self::Third => "3",
            Self::Fourth => "4",
            Self::Top => "5+",
        }
    }
}

impl fmt::Display for Gear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Telemetry {
    /// Store decoded values, returning which fields were updated
    pub fn apply(&mut self, values: &[PidValue], now: Instant) -> EnumSet<Field> {
        let mut fields = EnumSet::new();
        for value in values {
            match *value {
                PidValue::Rpm(rpm) => {
                    self.rpm.set(rpm, now);
                    fields |= Field::Rpm;
                }
                PidValue::Throttle(pct) => {
                    self.throttle_pct.set(pct.min(100), now);
                    fields |= Field::Throttle;
                }
                PidValue::Speed(kmh) => {
                    self.speed_kmh.set(kmh, now);
                    fields |= Field::Speed;
                }
            }
        }
        fields
    }

    /// Zero every field not updated within `max_age`
    pub fn sweep_stale(&mut self, now: Instant, max_age: Duration) -> EnumSet<Field> {
        let mut cleared = EnumSet::new();
        if self.rpm.is_stale(now, max_age) {
            self.rpm.clear();
            cleared |= Field::Rpm;
        }
        if self.throttle_pct.is_stale(now, max_age) {
            self.throttle_pct.clear();
            cleared |= Field::Throttle;
        }
        if self.speed_kmh.is_stale(now, max_age) {
            self.speed_kmh.clear();
            cleared |= Field::Speed;
        }
        if !cleared.is_empty() {
            debug!("🕒 Stale telemetry cleared: {cleared:?}");
        }
        cleared
    }

    /// Most recent update across all fields
    pub fn last_update(&self) -> Option<Instant> {
        [self.rpm.updated, self.throttle_pct.updated, self.speed_kmh.updated]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn values(&self) -> TelemetryValues {
        TelemetryValues {
            rpm: self.rpm.value,
            throttle_pct: self.throttle_pct.value,
            speed_kmh: self.speed_kmh.value,
        }
    }
}
