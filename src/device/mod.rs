//! Device registry, identities and decoded readings.
//!
//! Every supported device type is a variant of [`DeviceType`] and its decoded
//! state is the matching variant of [`Reading`]. Device types are resolved from
//! their configuration name at startup, never at first use.

pub mod core_temp;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use core_temp::{CoreTempReading, DataQuality};

/// Length of every broadcast payload. Byte 0 is always the page identifier.
pub const PAYLOAD_LEN: usize = 8;

/// One raw broadcast payload.
pub type Payload = [u8; PAYLOAD_LEN];

/// Supported device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Core body temperature sensor
    CoreTemp,
}

/// Returned when a configuration names a device type that is not registered.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown device type '{0}', expected one of: {names}", names = DeviceType::names())]
pub struct UnknownDeviceType(pub String);

impl DeviceType {
    /// Every registered device type.
    pub const ALL: &'static [DeviceType] = &[DeviceType::CoreTemp];

    /// ANT+ device type code.
    pub const fn code(self) -> u8 {
        match self {
            DeviceType::CoreTemp => 127,
        }
    }

    /// Configuration name (snake_case).
    pub const fn name(self) -> &'static str {
        match self {
            DeviceType::CoreTemp => "core_temp",
        }
    }

    /// Name used in default broker topics, e.g. `openant/CoreTemperature/1234`.
    pub const fn class_name(self) -> &'static str {
        match self {
            DeviceType::CoreTemp => "CoreTemperature",
        }
    }

    /// Channel period in 1/32768 s units.
    pub const fn channel_period(self) -> u16 {
        match self {
            // 2 Hz
            DeviceType::CoreTemp => 16384,
        }
    }

    /// Whether the device accepts workout profiles.
    pub const fn is_controllable(self) -> bool {
        match self {
            DeviceType::CoreTemp => false,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// A reading with every field unavailable.
    pub fn new_reading(self) -> Reading {
        match self {
            DeviceType::CoreTemp => Reading::CoreTemp(CoreTempReading::default()),
        }
    }

    fn names() -> String {
        Self::ALL
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| UnknownDeviceType(s.to_string()))
    }
}

/// Lookup key for a device channel: (type code, device id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub type_code: u8,
    pub device_id: u16,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_code, self.device_id)
    }
}

/// Immutable identity of a configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_type: DeviceType,
    /// Device number; 0 attaches to the first device found.
    pub device_id: u16,
    /// Transmission type; 0 matches any.
    pub transmission_type: u8,
    /// Display name used as the `device` tag.
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(device_type: DeviceType, device_id: u16, transmission_type: u8) -> Self {
        Self {
            device_type,
            device_id,
            transmission_type,
            name: format!("{}_{}", device_type.name(), device_id),
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            type_code: self.device_type.code(),
            device_id: self.device_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Last two event counters seen on "main data" pages.
///
/// Kept for gap/duplicate detection; nothing reads it to make decisions yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    previous: u8,
    current: u8,
}

impl SequenceTracker {
    /// Record a new counter, shifting the current one to previous.
    pub fn push(&mut self, counter: u8) {
        self.previous = self.current;
        self.current = counter;
    }

    pub fn previous(&self) -> u8 {
        self.previous
    }

    pub fn current(&self) -> u8 {
        self.current
    }
}

/// A single decoded field value handed to sinks.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(&'static str),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Page decoding rules for one device type.
///
/// Implementations mutate the reading in place; a page never touches fields
/// owned by another page.
pub trait PageDecoder {
    /// Apply `payload` to the reading. Returns the page name to route to sinks,
    /// or `None` when the page id is not recognised and nothing was changed.
    fn decode(
        &mut self,
        sequence: &mut SequenceTracker,
        payload: &Payload,
    ) -> Option<&'static str>;

    /// Available fields in a stable order. Unavailable fields are omitted.
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;
}

/// Decoded state of one device, one variant per device type.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    CoreTemp(CoreTempReading),
}

impl Reading {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Reading::CoreTemp(_) => DeviceType::CoreTemp,
        }
    }

    fn decoder(&mut self) -> &mut dyn PageDecoder {
        match self {
            Reading::CoreTemp(r) => r,
        }
    }

    pub fn decode(
        &mut self,
        sequence: &mut SequenceTracker,
        payload: &Payload,
    ) -> Option<&'static str> {
        self.decoder().decode(sequence, payload)
    }

    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        match self {
            Reading::CoreTemp(r) => r.fields(),
        }
    }
}
