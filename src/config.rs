//! JSON device configuration.
//!
//! ```json
//! {
//!   "devices": [{"device": "core_temp", "id": 1234, "transmission_type": 0}],
//!   "workouts": [{"type": "ramp", "start": 100, "stop": 200, "step": 25, "period": 60}]
//! }
//! ```
//!
//! Entries are validated one by one so an error can name the entry at fault.

use crate::device::{DeviceIdentity, DeviceType, UnknownDeviceType};
use crate::workout::Workout;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--config with the path to a JSON device configuration must be supplied")]
    MissingPath,
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{} has no 'devices' list", .path.display())]
    MissingDevices { path: PathBuf },
    #[error("failed to create device {entry} (#{index}) from {}: {reason}", .path.display())]
    Device {
        path: PathBuf,
        index: usize,
        entry: String,
        reason: String,
    },
    #[error("failed to parse workout #{index} in {}: {reason}", .path.display())]
    Workout {
        path: PathBuf,
        index: usize,
        reason: String,
    },
    #[error(transparent)]
    UnknownDevice(#[from] UnknownDeviceType),
}

/// Devices to open and workouts to offer them.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub devices: Vec<DeviceIdentity>,
    pub workouts: Option<Vec<Workout>>,
}

#[derive(Debug, Deserialize)]
struct Document {
    devices: Option<Vec<Value>>,
    workouts: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    device: String,
    id: u16,
    transmission_type: u8,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WorkoutEntry {
    Arrays {
        powers: Vec<u16>,
        /// Seconds per segment
        periods: Vec<f64>,
        #[serde(default = "default_cycles")]
        cycles: u32,
        #[serde(default, rename = "loop")]
        looping: bool,
    },
    Ramp {
        start: u16,
        stop: u16,
        step: u16,
        period: f64,
        #[serde(default)]
        peak: Option<u16>,
        #[serde(default = "default_cycles")]
        cycles: u32,
        #[serde(default, rename = "loop")]
        looping: bool,
    },
}

fn default_cycles() -> u32 {
    1
}

impl WorkoutEntry {
    fn build(self) -> Result<Workout, crate::workout::WorkoutError> {
        match self {
            WorkoutEntry::Arrays {
                powers,
                periods,
                cycles,
                looping,
            } => Workout::from_arrays(&powers, &periods, cycles, looping),
            WorkoutEntry::Ramp {
                start,
                stop,
                step,
                period,
                peak,
                cycles,
                looping,
            } => Workout::from_ramp(start, stop, step, period, peak, cycles, looping),
        }
    }
}

/// Read and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<DeviceConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, path)
}

/// Validate configuration `text`. `path` is only used in error messages.
pub fn parse(text: &str, path: &Path) -> Result<DeviceConfig, ConfigError> {
    let document: Document = serde_json::from_str(text).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let entries = document.devices.ok_or_else(|| ConfigError::MissingDevices {
        path: path.to_path_buf(),
    })?;

    let devices = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            device_from_entry(&entry).map_err(|reason| ConfigError::Device {
                path: path.to_path_buf(),
                index,
                entry: entry.to_string(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let workouts = document
        .workouts
        .map(|entries| {
            entries
                .into_iter()
                .enumerate()
                .map(|(index, entry)| {
                    workout_from_entry(entry).map_err(|reason| ConfigError::Workout {
                        path: path.to_path_buf(),
                        index,
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    Ok(DeviceConfig { devices, workouts })
}

/// Configuration for one device named on the command line.
pub fn single_device(
    name: &str,
    device_id: u16,
    transmission_type: u8,
) -> Result<DeviceConfig, ConfigError> {
    let device_type: DeviceType = name.parse()?;
    Ok(DeviceConfig {
        devices: vec![DeviceIdentity::new(
            device_type,
            device_id,
            transmission_type,
        )],
        workouts: None,
    })
}

fn device_from_entry(entry: &Value) -> Result<DeviceIdentity, String> {
    let entry = DeviceEntry::deserialize(entry).map_err(|e| e.to_string())?;
    let device_type: DeviceType = entry
        .device
        .parse()
        .map_err(|e: UnknownDeviceType| e.to_string())?;
    Ok(DeviceIdentity::new(
        device_type,
        entry.id,
        entry.transmission_type,
    ))
}

fn workout_from_entry(entry: Value) -> Result<Workout, String> {
    let entry: WorkoutEntry = serde_json::from_value(entry).map_err(|e| e.to_string())?;
    entry.build().map_err(|e| e.to_string())
}
