//! Transport reading hex-encoded broadcast frames from a line source.
//!
//! Each line is `<type code>:<device id> <payload hex>`, e.g.
//! `127:1234 0132 07A0 0512 1027`. Whitespace inside the payload is ignored.
//! This lets any external radio bridge pipe frames into the binary on stdin.

use super::{
    ChannelSpec, EVENT_CHANNEL_BUFFER_SIZE, StartFuture, Transport, TransportError,
    TransportEvent,
};
use crate::device::{DeviceKey, PAYLOAD_LEN, Payload};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors for malformed frame lines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("missing payload")]
    MissingPayload,
    #[error("invalid device key '{0}': expected type:id")]
    InvalidKey(String),
    #[error("invalid payload hex: {0}")]
    InvalidHex(String),
    #[error("payload must be {expected} bytes, got {0}", expected = PAYLOAD_LEN)]
    InvalidLength(usize),
}

/// Parse one frame line into the sending device and its payload.
pub fn parse_frame(line: &str) -> Result<(DeviceKey, Payload), FrameError> {
    let mut parts = line.split_whitespace();
    let key = parts.next().ok_or(FrameError::MissingPayload)?;
    let hex_payload: String = parts.collect();
    if hex_payload.is_empty() {
        return Err(FrameError::MissingPayload);
    }

    let key = key
        .split_once(':')
        .and_then(|(t, id)| {
            Some(DeviceKey {
                type_code: t.parse().ok()?,
                device_id: id.parse().ok()?,
            })
        })
        .ok_or_else(|| FrameError::InvalidKey(key.to_string()))?;

    let bytes = hex::decode(&hex_payload).map_err(|e| FrameError::InvalidHex(e.to_string()))?;
    let payload: Payload = bytes
        .as_slice()
        .try_into()
        .map_err(|_| FrameError::InvalidLength(bytes.len()))?;

    Ok((key, payload))
}

/// Channel bookkeeping shared with the reader task.
#[derive(Debug, Default)]
struct Channels {
    open: Vec<ChannelSpec>,
    /// Sending device -> configured channel (resolves wildcard ids).
    bound: HashMap<DeviceKey, DeviceKey>,
    found: HashSet<DeviceKey>,
    closed: HashSet<DeviceKey>,
}

impl Channels {
    /// Map a sending device onto a configured channel. An exact match wins;
    /// otherwise the first unbound wildcard (id 0) channel of the same type
    /// attaches to it.
    fn resolve(&mut self, sender: DeviceKey) -> Option<DeviceKey> {
        if let Some(key) = self.bound.get(&sender) {
            return Some(*key);
        }

        let key = self
            .open
            .iter()
            .map(|c| c.key)
            .find(|k| *k == sender)
            .or_else(|| {
                self.open.iter().map(|c| c.key).find(|k| {
                    k.type_code == sender.type_code
                        && k.device_id == 0
                        && !self.bound.values().any(|b| b == k)
                })
            })?;

        self.bound.insert(sender, key);
        Some(key)
    }

    /// Events to emit for one frame: `Found` precedes the first payload.
    fn events(&mut self, sender: DeviceKey, payload: Payload) -> Vec<TransportEvent> {
        let Some(key) = self.resolve(sender) else {
            debug!(device = %sender, "Frame from unconfigured device, dropping");
            return Vec::new();
        };
        if self.closed.contains(&key) {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if self.found.insert(key) {
            events.push(TransportEvent::Found(key));
        }
        events.push(TransportEvent::Payload(key, payload));
        events
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Transport`] over any async line source.
pub struct LineTransport<R> {
    source: Mutex<Option<R>>,
    channels: Arc<Mutex<Channels>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LineTransport<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> LineTransport<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(source: R) -> Self {
        Self {
            source: Mutex::new(Some(source)),
            channels: Arc::new(Mutex::new(Channels::default())),
            task: Mutex::new(None),
        }
    }

    async fn read_frames(
        source: R,
        channels: Arc<Mutex<Channels>>,
        tx: mpsc::Sender<TransportEvent>,
    ) {
        let mut lines = source.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Frame input closed");
                    return;
                }
                Err(error) => {
                    warn!(%error, "Failed to read frame input");
                    return;
                }
            };

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (sender, payload) = match parse_frame(line) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(%error, line, "Dropping malformed frame");
                    continue;
                }
            };

            let events = lock(&channels).events(sender, payload);
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl<R> Transport for LineTransport<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn start_receiving(&self, channels: Vec<ChannelSpec>) -> StartFuture<'_> {
        Box::pin(async move {
            let source = lock(&self.source)
                .take()
                .ok_or(TransportError::AlreadyStarted)?;

            lock(&self.channels).open = channels;

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            let handle = tokio::spawn(Self::read_frames(source, self.channels.clone(), tx));
            *lock(&self.task) = Some(handle);
            Ok(rx)
        })
    }

    fn close_channel(&self, key: DeviceKey) {
        if lock(&self.channels).closed.insert(key) {
            debug!(device = %key, "Channel closed");
        }
    }

    fn stop_receiving(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}
