use crate::device::{DeviceIdentity, DeviceKey, DeviceType, Payload, Reading, SequenceTracker};
use crate::output::{Sink, SinkError};
use crate::shutdown::ShutdownFlag;
use crate::transport::{ChannelSpec, StartFuture, Transport, TransportError, TransportEvent};
use crate::workout::Workout;
use futures::future::{self, BoxFuture};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Main data page: heat strain 5.0, counter 7, skin 8.0 °C, reserved 0x125,
/// core 100.0 °C.
pub const MAIN_PAGE: Payload = [0x01, 0x32, 0x07, 0xA0, 0x05, 0x12, 0x10, 0x27];

/// General page reporting `Good` data quality.
pub const GENERAL_PAGE: Payload = [0x00, 0xFF, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

pub fn core_temp_identity(device_id: u16) -> DeviceIdentity {
    DeviceIdentity::new(DeviceType::CoreTemp, device_id, 0)
}

/// A fresh core temperature reading with `payloads` applied in order.
pub fn decoded(payloads: &[Payload]) -> Reading {
    let mut reading = DeviceType::CoreTemp.new_reading();
    let mut sequence = SequenceTracker::default();
    for payload in payloads {
        reading.decode(&mut sequence, payload);
    }
    reading
}

/// Ordered record of calls shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Transport that replays a fixed list of events.
///
/// The event stream ends after the last event unless the transport is
/// [`held_open`](FakeTransport::held_open), in which case it ends on
/// `stop_receiving`.
#[derive(Debug, Default)]
pub struct FakeTransport {
    events: Vec<TransportEvent>,
    hold_open: bool,
    fail: bool,
    log: EventLog,
    shutdown: Option<ShutdownFlag>,
    started: Mutex<Vec<ChannelSpec>>,
    sender: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl FakeTransport {
    pub fn new(events: Vec<TransportEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Record the state of `flag` with every closed channel.
    pub fn observing(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.entries()
    }

    pub fn started_with(&self) -> Vec<ChannelSpec> {
        self.started.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn start_receiving(&self, channels: Vec<ChannelSpec>) -> StartFuture<'_> {
        if self.fail {
            return Box::pin(future::ready(Err(TransportError::AlreadyStarted)));
        }
        *self.started.lock().unwrap() = channels;

        let (tx, rx) = mpsc::channel(self.events.len().max(1));
        for event in &self.events {
            tx.try_send(event.clone()).unwrap();
        }
        if self.hold_open {
            *self.sender.lock().unwrap() = Some(tx);
        }
        Box::pin(future::ready(Ok(rx)))
    }

    fn close_channel(&self, key: DeviceKey) {
        match &self.shutdown {
            Some(flag) => self
                .log
                .push(format!("close_channel {key} shutdown={}", flag.is_set())),
            None => self.log.push(format!("close_channel {key}")),
        }
    }

    fn stop_receiving(&self) {
        self.log.push("stop_receiving");
        self.sender.lock().unwrap().take();
    }

    fn start_workouts(&self, key: DeviceKey, workouts: Vec<Workout>) {
        self.log.push(format!("workouts {key} {}", workouts.len()));
    }
}

/// One call to [`Sink::publish`] as seen by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub device: String,
    pub page_name: String,
    pub fields: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Record,
    Fail,
    Hang,
}

/// Sink that records what it is given.
#[derive(Debug)]
pub struct RecordingSink {
    name: &'static str,
    behaviour: Behaviour,
    log: EventLog,
    published: Arc<Mutex<Vec<Published>>>,
}

impl RecordingSink {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            behaviour: Behaviour::Record,
            log,
            published: Arc::default(),
        }
    }

    /// Every publish returns an error.
    pub fn failing(name: &'static str, log: EventLog) -> Self {
        Self {
            behaviour: Behaviour::Fail,
            ..Self::new(name, log)
        }
    }

    /// Every publish never completes.
    pub fn hanging(name: &'static str, log: EventLog) -> Self {
        Self {
            behaviour: Behaviour::Hang,
            ..Self::new(name, log)
        }
    }

    pub fn published(&self) -> Arc<Mutex<Vec<Published>>> {
        Arc::clone(&self.published)
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        self.name
    }

    fn publish<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        page_name: &'a str,
        reading: &'a Reading,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        match self.behaviour {
            Behaviour::Fail => Box::pin(future::ready(Err(SinkError::Write(
                "connection refused".into(),
            )))),
            Behaviour::Hang => Box::pin(future::pending()),
            Behaviour::Record => {
                self.published.lock().unwrap().push(Published {
                    device: identity.name.clone(),
                    page_name: page_name.to_string(),
                    fields: reading
                        .fields()
                        .into_iter()
                        .map(|(name, value)| (name, value.to_string()))
                        .collect(),
                });
                Box::pin(future::ready(Ok(())))
            }
        }
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.log.push(format!("close {}", self.name));
        Box::pin(future::ready(()))
    }
}
