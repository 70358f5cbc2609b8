//! `antplus-bridge` library.
//!
//! Decodes ANT+ broadcast pages into typed readings and fans them out to
//! InfluxDB or an MQTT broker. The binary (`src/main.rs`) is responsible for
//! logging setup, signals and process exit codes; everything it wires together
//! lives in [`crate::app`] where it can be tested with an injected transport.

#[cfg(not(any(feature = "influx", feature = "mqtt")))]
compile_error!("enable at least one sink feature: `influx` or `mqtt`");

pub mod app;
pub mod config;
pub mod device;
pub mod distributor;
pub mod output;
pub mod session;
pub mod shutdown;
pub mod topic;
pub mod transport;
pub mod workout;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use device::{DeviceIdentity, DeviceKey, DeviceType, FieldValue, Payload, Reading};
pub use distributor::Distributor;
pub use output::{Sink, SinkError};
pub use session::DeviceSession;
pub use shutdown::ShutdownFlag;
pub use transport::{Transport, TransportError, TransportEvent};
pub use workout::Workout;
