//! InfluxDB sink.
//!
//! Each decoded page becomes one line-protocol point: measurement = page name,
//! tags = device display name, run-scoped session id and host, fields = every
//! available reading field.

use super::{Sink, SinkError};
use crate::device::{DeviceIdentity, FieldValue, Reading};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

/// Escape commas, spaces and (for keys and tag values) equals signs.
fn escape(value: &str, escape_equals: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (escape_equals && c == '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn fmt_field_value(value: &FieldValue, fmt: &mut fmt::Formatter) -> fmt::Result {
    match value {
        FieldValue::Float(num) => write!(fmt, "{num}"),
        FieldValue::Integer(num) => write!(fmt, "{num}i"),
        FieldValue::Text(s) => write!(fmt, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape(key, true), escape(value, true))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}=", escape(key, true))?;
        fmt_field_value(value, fmt)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    if let Some(nanos) = data_point
        .timestamp
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
    {
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape(&self.measurement, false))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// Host identifier attached to every point.
pub fn host_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Time-series database client boundary.
pub trait PointWriter: Send + Sync {
    /// Write one line-protocol record to `bucket`.
    fn write<'a>(&'a self, bucket: &'a str, line: String) -> BoxFuture<'a, Result<(), SinkError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// InfluxDB v2 HTTP API writer.
#[derive(Debug)]
pub struct HttpPointWriter {
    client: reqwest::Client,
    url: String,
    org: String,
    token: Option<String>,
    closed: AtomicBool,
}

impl HttpPointWriter {
    /// Create a writer and verify the server answers a ping.
    pub async fn connect(url: &str, org: &str, token: Option<String>) -> Result<Self, SinkError> {
        let writer = Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            token,
            closed: AtomicBool::new(false),
        };

        writer
            .client
            .get(format!("{}/ping", writer.url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SinkError::Connect(format!("{}: {e}", writer.url)))?;

        info!(url = %writer.url, org = %writer.org, "Connected to InfluxDB");
        Ok(writer)
    }
}

impl PointWriter for HttpPointWriter {
    fn write<'a>(&'a self, bucket: &'a str, line: String) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(SinkError::Closed);
            }

            let mut request = self
                .client
                .post(format!("{}/api/v2/write", self.url))
                .query(&[
                    ("org", self.org.as_str()),
                    ("bucket", bucket),
                    ("precision", "ns"),
                ])
                .body(line);
            if let Some(token) = &self.token {
                request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
            }

            request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map(|_| ())
                .map_err(|e| SinkError::Write(e.to_string()))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
        })
    }
}

/// Sink writing one point per decoded page.
pub struct InfluxSink<W = HttpPointWriter> {
    writer: W,
    bucket: String,
    session_id: Uuid,
    host: String,
    closed: AtomicBool,
}

impl<W: PointWriter> InfluxSink<W> {
    pub fn new(writer: W, bucket: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            writer,
            bucket: bucket.into(),
            session_id: Uuid::new_v4(),
            host: host.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn tag_set(&self, identity: &DeviceIdentity) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("device".to_string(), identity.name.clone()),
            ("uuid".to_string(), self.session_id.to_string()),
            ("host".to_string(), self.host.clone()),
        ])
    }

    pub fn to_data_point(
        &self,
        identity: &DeviceIdentity,
        page_name: &str,
        reading: &Reading,
    ) -> DataPoint {
        DataPoint {
            measurement: page_name.to_string(),
            tag_set: self.tag_set(identity),
            field_set: reading
                .fields()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            timestamp: Some(SystemTime::now()),
        }
    }
}

impl<W: PointWriter> Sink for InfluxSink<W> {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn publish<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        page_name: &'a str,
        reading: &'a Reading,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let point = self.to_data_point(identity, page_name, reading);
            if point.field_set.is_empty() {
                debug!(device = %identity, "No available fields, skipping point");
                return Ok(());
            }

            let line = point.to_string();
            debug!(%line, "Writing point");
            self.writer.write(&self.bucket, line).await
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.writer.close().await;
                info!("InfluxDB sink closed");
            }
        })
    }
}
