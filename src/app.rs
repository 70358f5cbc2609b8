//! Command-line options and the top-level run function for `antplus-bridge`.
//!
//! Kept apart from process setup (logging, exit codes, signals) so it can be
//! tested with an injected transport and stop future.

use crate::config::{self, ConfigError, DeviceConfig};
use crate::distributor::Distributor;
use crate::output::{Sink, SinkError};
use crate::session::DeviceSession;
use crate::shutdown::ShutdownFlag;
use crate::transport::{Transport, TransportError};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Device name that selects devices from `--config`.
pub const CONFIG_DEVICE: &str = "config";

/// Decode ANT+ sensor broadcasts read from stdin and forward the readings to a
/// data sink.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub target: Target,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Target {
    /// Write device data to InfluxDB
    #[cfg(feature = "influx")]
    Influx(InfluxArgs),
    /// Publish device data to an MQTT broker
    #[cfg(feature = "mqtt")]
    Mqtt(MqttArgs),
}

/// Options shared by every sink.
#[derive(Args, Debug, Clone)]
pub struct GeneralArgs {
    /// Device type to receive from (e.g. core_temp), or `config` to read
    /// devices and workouts from --config
    pub device: String,

    /// JSON device configuration, used with device `config`
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Device id; 0 attaches to the first device found
    #[arg(short = 'I', long, default_value_t = 0)]
    pub id: u16,

    /// Transmission type; 0 matches any
    #[arg(short = 'T', long = "transtype", default_value_t = 0)]
    pub transmission_type: u8,

    /// Verbose output, log every decoded page
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[cfg(feature = "influx")]
#[derive(Args, Debug, Clone)]
pub struct InfluxArgs {
    #[command(flatten)]
    pub general: GeneralArgs,

    /// InfluxDB server URL
    #[arg(long, default_value = "http://localhost:8086")]
    pub url: String,

    /// API token
    #[arg(long)]
    pub token: Option<String>,

    #[arg(long, default_value = "my-org")]
    pub org: String,

    #[arg(long, default_value = "my-bucket")]
    pub bucket: String,

    /// Value of the `host` tag; defaults to the machine host name
    #[arg(long)]
    pub host_tag: Option<String>,
}

#[cfg(feature = "mqtt")]
#[derive(Args, Debug, Clone)]
pub struct MqttArgs {
    #[command(flatten)]
    pub general: GeneralArgs,

    /// Broker host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    pub port: u16,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Publish every field to its own `<topic>/<field>` topic
    #[arg(long)]
    pub topic_per_field: bool,

    /// Override the topic of one device.
    /// Format: --device-topic 127:1234:home/core_temp
    #[arg(
        long = "device-topic",
        value_parser = crate::topic::parse_device_topic,
        value_name = "TYPE:ID:TOPIC"
    )]
    pub device_topics: Vec<crate::topic::DeviceTopic>,
}

impl Cli {
    pub fn general(&self) -> &GeneralArgs {
        self.target.general()
    }
}

impl Target {
    pub fn general(&self) -> &GeneralArgs {
        match self {
            #[cfg(feature = "influx")]
            Target::Influx(args) => &args.general,
            #[cfg(feature = "mqtt")]
            Target::Mqtt(args) => &args.general,
        }
    }
}

/// Errors returned by [`run`].
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Devices named on the command line, or listed in the configuration file.
pub fn load_devices(args: &GeneralArgs) -> Result<DeviceConfig, ConfigError> {
    if args.device == CONFIG_DEVICE {
        let path = args.config.as_deref().ok_or(ConfigError::MissingPath)?;
        return config::load(path);
    }
    config::single_device(&args.device, args.id, args.transmission_type)
}

/// Connect the sink selected by `target`.
pub async fn build_sink(
    target: &Target,
    shutdown: &ShutdownFlag,
) -> Result<Box<dyn Sink>, SinkError> {
    match target {
        #[cfg(feature = "influx")]
        Target::Influx(args) => {
            use crate::output::influxdb::{HttpPointWriter, InfluxSink, host_name};

            let writer =
                HttpPointWriter::connect(&args.url, &args.org, args.token.clone()).await?;
            let host = args.host_tag.clone().unwrap_or_else(host_name);
            let sink = InfluxSink::new(writer, args.bucket.clone(), host);
            tracing::info!(
                url = %args.url,
                bucket = %args.bucket,
                session = %sink.session_id(),
                "InfluxDB sink ready"
            );
            Ok(Box::new(sink))
        }
        #[cfg(feature = "mqtt")]
        Target::Mqtt(args) => {
            use crate::output::mqtt::{BrokerSettings, MqttSink, PublishMode, RumqttcClient};
            use crate::output::reconnect::ReconnectPolicy;

            let settings = BrokerSettings {
                host: args.host.clone(),
                port: args.port,
                user: args.user.clone(),
                password: args.password.clone(),
            };
            let client =
                RumqttcClient::connect(&settings, shutdown.clone(), ReconnectPolicy::default())
                    .await?;
            let mode = if args.topic_per_field {
                PublishMode::PerField
            } else {
                PublishMode::Aggregate
            };
            let topics = crate::topic::to_map(&args.device_topics);
            Ok(Box::new(MqttSink::new(
                client,
                topics,
                mode,
                shutdown.clone(),
            )))
        }
    }
}

/// Load devices, connect the sink, then receive from `transport` until `stop`
/// resolves or the transport ends.
///
/// Configuration errors are returned before the sink or transport is touched.
pub async fn run<S>(cli: Cli, transport: &dyn Transport, stop: S) -> Result<(), RunError>
where
    S: Future<Output = ()>,
{
    let config = load_devices(cli.general())?;
    let shutdown = ShutdownFlag::new();
    let sink = build_sink(&cli.target, &shutdown).await?;

    let sessions = config.devices.into_iter().map(DeviceSession::new).collect();
    let mut distributor = Distributor::new(vec![sink], shutdown);
    distributor
        .run(transport, sessions, config.workouts, stop)
        .await?;
    Ok(())
}
