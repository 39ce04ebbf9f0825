//! Bluetooth identifiers shared by the transports and managers

use std::fmt;
use std::str::FromStr;

use derive_more::{Display, Error};
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

/// 6-byte device address, most significant byte first as printed
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BdAddr(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("invalid Bluetooth address: {input}")]
pub struct AddrParseError {
    pub input: String,
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddrParseError {
            input: s.to_string(),
        };
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BdAddr {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BdAddr> for String {
    fn from(addr: BdAddr) -> Self {
        addr.to_string()
    }
}

/// BLE address type captured from the advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrType {
    #[default]
    Public,
    Random,
    RpaPublic,
    RpaRandom,
}

impl AddrType {
    /// From the controller's numeric encoding
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Random,
            2 => Self::RpaPublic,
            3 => Self::RpaRandom,
            _ => Self::Public,
        }
    }

    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Public => 0,
            Self::Random => 1,
            Self::RpaPublic => 2,
            Self::RpaRandom => 3,
        }
    }
}

/// Attribute UUID. 128-bit values are stored little-endian, the order the
/// Bluetooth controller uses on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtUuid {
    U16(u16),
    U128([u8; 16]),
}

impl BtUuid {
    /// Bluetooth base UUID 00000000-0000-1000-8000-00805F9B34FB, little-endian
    const BASE: [u8; 16] = [
        0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    /// Build a 128-bit UUID from its printed big-endian form
    pub const fn from_u128(value: u128) -> Self {
        Self::U128(value.to_le_bytes())
    }

    /// A 16-bit UUID may arrive in its expanded 128-bit form
    fn short(&self) -> Option<u16> {
        match *self {
            Self::U16(v) => Some(v),
            Self::U128(b) => {
                let mut base = Self::BASE;
                base[12] = b[12];
                base[13] = b[13];
                (base == b).then(|| u16::from_le_bytes([b[12], b[13]]))
            }
        }
    }

    /// Equality that treats a 16-bit UUID and its base expansion as the same
    pub fn matches(&self, other: &BtUuid) -> bool {
        match (self.short(), other.short()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }
}

impl fmt::Debug for BtUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::U16(v) => write!(f, "0x{v:04X}"),
            Self::U128(b) => {
                let v = u128::from_le_bytes(b);
                write!(
                    f,
                    "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                    v >> 96,
                    (v >> 80) & 0xFFFF,
                    (v >> 64) & 0xFFFF,
                    (v >> 48) & 0xFFFF,
                    v & 0xFFFF_FFFF_FFFF
                )
            }
        }
    }
}

/// Characteristic capability bits
#[derive(EnumSetType, Debug)]
pub enum CharProperty {
    Broadcast,
    Read,
    WriteNoResponse,
    Write,
    Notify,
    Indicate,
}

impl CharProperty {
    /// Decode the GATT characteristic properties byte
    pub fn from_bits(bits: u8) -> EnumSet<Self> {
        let table = [
            (0x01, Self::Broadcast),
            (0x02, Self::Read),
            (0x04, Self::WriteNoResponse),
            (0x08, Self::Write),
            (0x10, Self::Notify),
            (0x20, Self::Indicate),
        ];
        table
            .into_iter()
            .filter(|(mask, _)| bits & mask != 0)
            .map(|(_, prop)| prop)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: BtUuid,
    pub handle: u16,
    pub properties: EnumSet<CharProperty>,
}

impl Characteristic {
    pub fn can_notify(&self) -> bool {
        self.properties.contains(CharProperty::Notify)
    }

    pub fn can_write(&self) -> bool {
        !self
            .properties
            .is_disjoint(CharProperty::Write | CharProperty::WriteNoResponse)
    }
}

/// Attribute handle range of a discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRange {
    pub start: u16,
    pub end: u16,
}

/// Transport-assigned connection identifier
pub type ConnId = u16;
