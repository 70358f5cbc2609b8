//! Core body temperature sensor (ANT+ device type 127).
//!
//! Two pages are broadcast:
//! - `0x00` general info: data quality in byte 2.
//! - `0x01` main data: heat strain index, event counter, skin temperature,
//!   a reserved field and core temperature. Skin temperature and the reserved
//!   field share byte 4 (high and low nibble respectively).

use super::{FieldValue, PageDecoder, Payload, SequenceTracker};

pub const PAGE_GENERAL: u8 = 0x00;
pub const PAGE_MAIN: u8 = 0x01;

/// Page name routed to sinks for every core temperature page.
pub const PAGE_NAME: &str = "core_temp";

const HEAT_STRAIN_UNAVAILABLE: u8 = 0xFF;
const SKIN_TEMP_UNAVAILABLE: u16 = 0x800;
const CORE_TEMP_UNAVAILABLE: u16 = 0x8000;
const RESERVED_UNAVAILABLE: u16 = 0x800;

const HEAT_STRAIN_SCALE: f64 = 0.1;
const SKIN_TEMP_SCALE: f64 = 0.05;
const CORE_TEMP_SCALE: f64 = 0.01;

/// Sensor-reported data quality. Any undefined byte maps to `Unused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataQuality {
    Poor,
    Fair,
    Good,
    Excellent,
    Unused,
}

impl From<u8> for DataQuality {
    fn from(value: u8) -> Self {
        match value {
            0 => DataQuality::Poor,
            1 => DataQuality::Fair,
            2 => DataQuality::Good,
            3 => DataQuality::Excellent,
            _ => DataQuality::Unused,
        }
    }
}

impl DataQuality {
    pub const fn as_str(self) -> &'static str {
        match self {
            DataQuality::Poor => "Poor",
            DataQuality::Fair => "Fair",
            DataQuality::Good => "Good",
            DataQuality::Excellent => "Excellent",
            DataQuality::Unused => "Unused",
        }
    }
}

/// Decoded core temperature state. `None` means no data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreTempReading {
    pub quality: Option<DataQuality>,
    /// Skin temperature in °C
    pub skin_temp: Option<f64>,
    /// Core body temperature in °C
    pub core_temp: Option<f64>,
    /// Heat strain index (a.u.)
    pub heat_strain_index: Option<f64>,
    pub reserved: Option<u16>,
}

/// 12-bit skin temperature: byte 3 plus the high nibble of byte 4 as bits 8..12.
#[inline]
fn skin_temp_raw(payload: &Payload) -> u16 {
    u16::from(payload[3]) | ((u16::from(payload[4]) & 0xF0) << 4)
}

/// 12-bit reserved field: byte 5 as bits 4..12 plus the low nibble of byte 4.
#[inline]
fn reserved_raw(payload: &Payload) -> u16 {
    (u16::from(payload[5]) << 4) | (u16::from(payload[4]) & 0x0F)
}

#[inline]
fn core_temp_raw(payload: &Payload) -> u16 {
    u16::from_le_bytes([payload[6], payload[7]])
}

#[inline]
fn scaled<T: PartialEq + Into<f64>>(raw: T, sentinel: T, scale: f64) -> Option<f64> {
    (raw != sentinel).then(|| raw.into() * scale)
}

impl CoreTempReading {
    fn apply_main_page(&mut self, sequence: &mut SequenceTracker, payload: &Payload) {
        sequence.push(payload[2]);

        self.heat_strain_index = scaled(payload[1], HEAT_STRAIN_UNAVAILABLE, HEAT_STRAIN_SCALE);
        self.skin_temp = scaled(skin_temp_raw(payload), SKIN_TEMP_UNAVAILABLE, SKIN_TEMP_SCALE);
        self.core_temp = scaled(core_temp_raw(payload), CORE_TEMP_UNAVAILABLE, CORE_TEMP_SCALE);

        let reserved = reserved_raw(payload);
        self.reserved = (reserved != RESERVED_UNAVAILABLE).then_some(reserved);
    }
}

impl PageDecoder for CoreTempReading {
    fn decode(
        &mut self,
        sequence: &mut SequenceTracker,
        payload: &Payload,
    ) -> Option<&'static str> {
        match payload[0] {
            PAGE_GENERAL => self.quality = Some(DataQuality::from(payload[2])),
            PAGE_MAIN => self.apply_main_page(sequence, payload),
            _ => return None,
        }
        Some(PAGE_NAME)
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        let mut fields = Vec::with_capacity(5);

        macro_rules! add {
            ($name:literal, $val:expr) => {
                if let Some(v) = $val {
                    fields.push(($name, v));
                }
            };
        }

        add!("quality", self.quality.map(|q| FieldValue::Text(q.as_str())));
        add!("skin_temp", self.skin_temp.map(FieldValue::Float));
        add!("core_temp", self.core_temp.map(FieldValue::Float));
        add!(
            "heat_strain_index",
            self.heat_strain_index.map(FieldValue::Float)
        );
        add!(
            "reserved",
            self.reserved.map(|r| FieldValue::Integer(i64::from(r)))
        );

        fields
    }
}
