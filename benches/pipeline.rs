//! Integration benchmark for the receive pipeline.
//!
//! Feeds payload events from a fake transport through the distributor to
//! sinks that discard what they are given.

use antplus_bridge::device::{DeviceIdentity, DeviceKey, DeviceType, Payload, Reading};
use antplus_bridge::distributor::Distributor;
use antplus_bridge::output::{Sink, SinkError};
use antplus_bridge::session::DeviceSession;
use antplus_bridge::shutdown::ShutdownFlag;
use antplus_bridge::transport::{ChannelSpec, StartFuture, Transport, TransportEvent};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::future::{self, BoxFuture};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const MAIN_PAGE: Payload = [0x01, 0x32, 0x07, 0xA0, 0x05, 0x12, 0x10, 0x27];
const GENERAL_PAGE: Payload = [0x00, 0xFF, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// A transport that replays pre-built events, similar to the one in the
/// distributor tests.
struct FakeTransport {
    events: Vec<TransportEvent>,
}

impl Transport for FakeTransport {
    fn start_receiving(&self, _channels: Vec<ChannelSpec>) -> StartFuture<'_> {
        let events = self.events.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(events.len().max(1));
            tokio::spawn(async move {
                for event in events {
                    let _ = tx.send(event).await;
                }
            });
            Ok(rx)
        })
    }

    fn close_channel(&self, _key: DeviceKey) {}

    fn stop_receiving(&self) {}
}

struct NullSink;

impl Sink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn publish<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        page_name: &'a str,
        reading: &'a Reading,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        black_box((identity, page_name, reading.fields()));
        Box::pin(future::ready(Ok(())))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }
}

fn identities(devices: u16) -> Vec<DeviceIdentity> {
    (1..=devices)
        .map(|id| DeviceIdentity::new(DeviceType::CoreTemp, id, 0))
        .collect()
}

/// `per_device` payloads for each device, interleaved across devices.
fn events(identities: &[DeviceIdentity], per_device: usize) -> Vec<TransportEvent> {
    let mut events: Vec<_> = identities
        .iter()
        .map(|identity| TransportEvent::Found(identity.key()))
        .collect();
    for n in 0..per_device {
        let payload = if n % 4 == 0 { GENERAL_PAGE } else { MAIN_PAGE };
        events.extend(
            identities
                .iter()
                .map(|identity| TransportEvent::Payload(identity.key(), payload)),
        );
    }
    events
}

fn run_pipeline(
    rt: &Runtime,
    identities: &[DeviceIdentity],
    events: Vec<TransportEvent>,
    sinks: usize,
) {
    let transport = FakeTransport { events };
    let sessions = identities.iter().cloned().map(DeviceSession::new).collect();
    let sinks = (0..sinks)
        .map(|_| Box::new(NullSink) as Box<dyn Sink>)
        .collect();
    let mut distributor = Distributor::new(sinks, ShutdownFlag::new());

    rt.block_on(async {
        distributor
            .run(&transport, sessions, None, future::pending())
            .await
            .unwrap();
    });
}

/// Benchmark one device through the full pipeline at different batch sizes
fn bench_batch_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_pipeline");
    let rt = Runtime::new().unwrap();
    let identities = identities(1);

    for batch_size in [1, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &size| {
                let events = events(&identities, size);
                b.iter(|| run_pipeline(&rt, &identities, events.clone(), 1))
            },
        );
    }

    group.finish();
}

/// Benchmark fan-out to several sinks from several devices
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let rt = Runtime::new().unwrap();
    let identities = identities(8);
    let events = events(&identities, 25);

    for sinks in [1, 2, 4] {
        group.throughput(Throughput::Elements(200));
        group.bench_with_input(BenchmarkId::new("sinks", sinks), &sinks, |b, &sinks| {
            b.iter(|| run_pipeline(&rt, &identities, events.clone(), sinks))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batch_pipeline, bench_fan_out);
criterion_main!(benches);
