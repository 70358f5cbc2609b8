//! Sinks receiving decoded readings.
//!
//! A [`Sink`] performs a best-effort write of one (device, page, reading) tuple
//! to an external system. Failures are returned to the distributor, which logs
//! them and carries on with the other sinks.

#[cfg(feature = "influx")]
pub mod influxdb;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod reconnect;

use crate::device::{DeviceIdentity, Reading};
use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("reconnect failed: {0}")]
    Reconnect(String),
    #[error("sink is closed")]
    Closed,
}

/// An external system receiving decoded readings.
pub trait Sink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Write one decoded page.
    fn publish<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        page_name: &'a str,
        reading: &'a Reading,
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Flush and release the backing client. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}
