//! Per-device decoding session.

use crate::device::{DeviceIdentity, DeviceKey, Payload, Reading, SequenceTracker};
use crate::transport::{ChannelSpec, Transport};
use crate::workout::Workout;
use tracing::{debug, info};

/// A decoded page ready for the sinks.
#[derive(Debug)]
pub struct Update<'a> {
    pub identity: &'a DeviceIdentity,
    pub page_name: &'static str,
    pub reading: &'a Reading,
}

/// Owns the reading of one device and applies incoming payloads to it in
/// arrival order.
#[derive(Debug)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    reading: Reading,
    sequence: SequenceTracker,
    workouts: Option<Vec<Workout>>,
    found: bool,
    closed: bool,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            reading: identity.device_type.new_reading(),
            identity,
            sequence: SequenceTracker::default(),
            workouts: None,
            found: false,
            closed: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn key(&self) -> DeviceKey {
        self.identity.key()
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    pub fn sequence(&self) -> SequenceTracker {
        self.sequence
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            key: self.key(),
            transmission_type: self.identity.transmission_type,
            period: self.identity.device_type.channel_period(),
        }
    }

    /// Queue workouts to start when the device is found. Returns `false` if the
    /// device type cannot run workouts.
    pub fn assign_workouts(&mut self, workouts: Vec<Workout>) -> bool {
        if !self.identity.device_type.is_controllable() {
            return false;
        }
        self.workouts = Some(workouts);
        true
    }

    /// Mark the device live. Pending workouts are returned on the first call
    /// only.
    pub fn on_found(&mut self) -> Option<Vec<Workout>> {
        if !self.found {
            self.found = true;
            info!(device = %self.identity, "Device found and receiving");
        }
        self.workouts.take()
    }

    /// Decode one payload in place. Returns `None` for unknown pages and after
    /// the session is closed.
    pub fn on_payload(&mut self, payload: &Payload) -> Option<Update<'_>> {
        if self.closed {
            return None;
        }

        let Some(page_name) = self.reading.decode(&mut self.sequence, payload) else {
            debug!(device = %self.identity, page = payload[0], "Ignoring unknown page");
            return None;
        };
        debug!(device = %self.identity, page_name, "Decoded page");

        Some(Update {
            identity: &self.identity,
            page_name,
            reading: &self.reading,
        })
    }

    /// Release the transport channel. Idempotent.
    pub fn close(&mut self, transport: &dyn Transport) {
        if self.closed {
            return;
        }
        self.closed = true;
        transport.close_channel(self.key());
    }
}
