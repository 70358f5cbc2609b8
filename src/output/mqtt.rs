//! MQTT sink.
//!
//! Readings are published either as one JSON object per device topic, tagged
//! with the page name under `_type`, or as one message per field on
//! `<device topic>/<field>`. The broker connection is driven by its own task,
//! which runs the reconnect protocol when the connection drops.

use super::reconnect::{Reconnect, ReconnectOutcome, ReconnectPolicy, reconnect_with_backoff};
use super::{Sink, SinkError};
use crate::device::{DeviceIdentity, FieldValue, Reading};
use crate::shutdown::ShutdownFlag;
use crate::topic::{TopicMap, resolve_topic};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key carrying the page name in published payloads.
pub const TYPE_KEY: &str = "_type";

/// Requests buffered between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long a disconnect waits for the driver to send it before the driver
/// is stopped.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// One JSON message per device topic
    #[default]
    Aggregate,
    /// One message per field on `<device topic>/<field>`
    PerField,
}

/// Message-broker client boundary.
pub trait BrokerClient: Send + Sync {
    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'_, Result<(), SinkError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SinkError>>;
}

/// Connection settings for [`RumqttcClient`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl BrokerSettings {
    fn client_id() -> String {
        format!("openant-mqtt_{}", Uuid::new_v4())
    }

    fn to_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(Self::client_id(), &self.host, self.port);
        options.set_clean_session(false);
        if let Some(user) = &self.user {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// What a poll of the broker connection produced, as far as the driver cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEvent {
    Connected,
    /// The client sent its disconnect; the connection is finished.
    Disconnected,
    Other,
}

/// A broker connection that is polled for events and can be re-established.
trait BrokerConnection: Reconnect {
    fn poll(&mut self) -> BoxFuture<'_, Result<ConnectionEvent, SinkError>>;
}

/// rumqttc event loop as a reconnectable connection. Each poll after a
/// failure is one connection attempt.
struct EventLoopConnection(EventLoop);

impl BrokerConnection for EventLoopConnection {
    fn poll(&mut self) -> BoxFuture<'_, Result<ConnectionEvent, SinkError>> {
        Box::pin(async move {
            match self.0.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(ConnectionEvent::Connected),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => Ok(ConnectionEvent::Disconnected),
                Ok(event) => {
                    debug!(?event, "MQTT event");
                    Ok(ConnectionEvent::Other)
                }
                Err(e) => Err(SinkError::Connect(e.to_string())),
            }
        })
    }
}

impl Reconnect for EventLoopConnection {
    fn reconnect(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            match BrokerConnection::poll(self).await {
                Ok(ConnectionEvent::Connected) => Ok(()),
                Ok(event) => Err(SinkError::Reconnect(format!("unexpected event {event:?}"))),
                Err(e) => Err(SinkError::Reconnect(e.to_string())),
            }
        })
    }
}

/// Poll the connection until the client disconnects or shutdown suppresses
/// reconnection.
async fn drive<C: BrokerConnection>(
    mut connection: C,
    shutdown: ShutdownFlag,
    policy: ReconnectPolicy,
) {
    loop {
        match connection.poll().await {
            Ok(ConnectionEvent::Disconnected) => {
                debug!("MQTT client disconnected");
                return;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "MQTT connection lost");
                match reconnect_with_backoff(&shutdown, &policy, &mut connection).await {
                    ReconnectOutcome::Reconnected { .. } => {}
                    ReconnectOutcome::Suppressed => return,
                    // The next failed poll starts a fresh retry cycle.
                    ReconnectOutcome::Exhausted => {}
                }
            }
        }
    }
}

/// [`BrokerClient`] backed by rumqttc.
pub struct RumqttcClient {
    client: AsyncClient,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcClient {
    /// Connect and wait for the broker to acknowledge, then hand the event loop
    /// to a background task.
    pub async fn connect(
        settings: &BrokerSettings,
        shutdown: ShutdownFlag,
        policy: ReconnectPolicy,
    ) -> Result<Self, SinkError> {
        let (client, eventloop) =
            AsyncClient::new(settings.to_options(), REQUEST_CHANNEL_CAPACITY);

        let mut connection = EventLoopConnection(eventloop);
        loop {
            match connection.poll().await {
                Ok(ConnectionEvent::Connected) => break,
                Ok(_) => {}
                Err(SinkError::Connect(reason)) => {
                    return Err(SinkError::Connect(format!(
                        "{}:{}: {reason}",
                        settings.host, settings.port
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        info!(host = %settings.host, port = settings.port, "Connected to MQTT broker");

        let driver = tokio::spawn(drive(connection, shutdown, policy));
        Ok(Self {
            client,
            driver: Mutex::new(Some(driver)),
        })
    }
}

impl BrokerClient for RumqttcClient {
    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'_, Result<(), SinkError>> {
        // Fails instead of waiting when the request queue is full.
        let result = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| SinkError::Publish(e.to_string()));
        Box::pin(async move { result })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            // Never waits for queue space: the driver may be asleep in a
            // reconnect backoff and not draining requests.
            let result = self
                .client
                .try_disconnect()
                .map_err(|e| SinkError::Publish(e.to_string()));

            let driver = self
                .driver
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(mut driver) = driver {
                let flushed = result.is_ok()
                    && timeout(DISCONNECT_TIMEOUT, &mut driver).await.is_ok();
                if !flushed {
                    debug!("Stopping MQTT driver");
                    driver.abort();
                }
            }
            result
        })
    }
}

fn json_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Float(num) => Value::from(*num),
        FieldValue::Integer(num) => Value::from(*num),
        FieldValue::Text(s) => Value::from(*s),
    }
}

/// Sink publishing readings to per-device topics.
pub struct MqttSink<C = RumqttcClient> {
    client: C,
    topics: TopicMap,
    mode: PublishMode,
    shutdown: ShutdownFlag,
    closed: AtomicBool,
}

impl<C: BrokerClient> MqttSink<C> {
    pub fn new(client: C, topics: TopicMap, mode: PublishMode, shutdown: ShutdownFlag) -> Self {
        Self {
            client,
            topics,
            mode,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic_for(&self, identity: &DeviceIdentity) -> String {
        resolve_topic(identity, &self.topics)
    }

    /// JSON payload: the page name under [`TYPE_KEY`] plus every available field.
    pub fn payload(page_name: &str, reading: &Reading) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(TYPE_KEY.to_string(), Value::from(page_name));
        for (name, value) in reading.fields() {
            payload.insert(name.to_string(), json_value(&value));
        }
        payload
    }

    async fn publish_fields(
        &self,
        topic: &str,
        page_name: &str,
        reading: &Reading,
    ) -> Result<(), SinkError> {
        let messages = std::iter::once((TYPE_KEY, page_name.to_string())).chain(
            reading
                .fields()
                .into_iter()
                .map(|(name, value)| (name, value.to_string())),
        );

        let mut first_error = None;
        for (name, value) in messages {
            let field_topic = format!("{topic}/{name}");
            debug!(topic = %field_topic, %value, "Publishing field");
            if let Err(error) = self.client.publish(field_topic, value.into_bytes()).await {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<C: BrokerClient> Sink for MqttSink<C> {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        page_name: &'a str,
        reading: &'a Reading,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let topic = self.topic_for(identity);
            match self.mode {
                PublishMode::Aggregate => {
                    let payload = serde_json::to_vec(&Self::payload(page_name, reading))?;
                    debug!(%topic, bytes = payload.len(), "Publishing reading");
                    self.client.publish(topic, payload).await
                }
                PublishMode::PerField => self.publish_fields(&topic, page_name, reading).await,
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            // The flag must be up before the connection drops so the driver
            // does not treat the disconnect as a reason to reconnect.
            self.shutdown.trigger();
            match self.client.disconnect().await {
                Ok(()) => info!("MQTT sink closed"),
                Err(error) => warn!(%error, "MQTT disconnect failed"),
            }
        })
    }
}
