//! Radio transport abstraction.
//!
//! The transport owns the ANT channels. It reports device discovery and raw
//! broadcast payloads as [`TransportEvent`]s over a channel, which lets the
//! distributor stay the single writer of every device session.

pub mod line;

use crate::device::{DeviceKey, Payload};
use crate::workout::Workout;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel buffer size for transport events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Channel parameters for one configured device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub key: DeviceKey,
    pub transmission_type: u8,
    /// Channel period in 1/32768 s units
    pub period: u16,
}

/// Events delivered by a running transport, keyed by the configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The device was found and its channel is receiving.
    Found(DeviceKey),
    /// A broadcast payload arrived.
    Payload(DeviceKey, Payload),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
}

/// Future returned by [`Transport::start_receiving`].
pub type StartFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::Receiver<TransportEvent>, TransportError>> + Send + 'a>>;

/// Radio transport boundary.
pub trait Transport: Send + Sync {
    /// Open one channel per [`ChannelSpec`] and start receiving. The returned stream ends
    /// when the transport terminates or [`Transport::stop_receiving`] is called.
    fn start_receiving(&self, channels: Vec<ChannelSpec>) -> StartFuture<'_>;

    /// Release the channel of one device. Idempotent.
    fn close_channel(&self, key: DeviceKey);

    /// Stop the receive loop.
    fn stop_receiving(&self);

    /// Run workouts on a controllable device.
    fn start_workouts(&self, key: DeviceKey, workouts: Vec<Workout>) {
        tracing::warn!(
            device = %key,
            count = workouts.len(),
            "Transport cannot run workouts, ignoring"
        );
    }
}
