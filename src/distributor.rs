//! Fan-out of decoded readings from device sessions to sinks.
//!
//! [`Distributor::run`] owns the receive loop. Events from the transport are
//! routed to sessions through a registration table keyed by [`DeviceKey`], and
//! every decoded page is queued to each sink's delivery task, so a slow sink
//! never holds up the loop. When the loop ends the shutdown runs in a fixed
//! order: raise the [`ShutdownFlag`], close every channel, stop the transport,
//! drain and close every sink.

use crate::device::{DeviceIdentity, DeviceKey, Reading};
use crate::output::Sink;
use crate::session::DeviceSession;
use crate::shutdown::ShutdownFlag;
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::workout::Workout;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Readings buffered per sink before new ones are dropped.
const SINK_QUEUE_CAPACITY: usize = 256;

/// How long shutdown waits for a sink to drain its queue, and then to close.
const SINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One decoded page, owned so it can outlive the receive loop iteration.
struct Delivery {
    identity: DeviceIdentity,
    page_name: String,
    reading: Reading,
}

/// A sink's queue and the task draining it.
struct SinkWorker {
    sink: Arc<dyn Sink>,
    queue: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

impl SinkWorker {
    fn spawn(sink: Arc<dyn Sink>) -> Self {
        let (queue, deliveries) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let task = tokio::spawn(deliver(Arc::clone(&sink), deliveries));
        Self { sink, queue, task }
    }

    /// Stop accepting readings and wait for the queued ones, giving up on a
    /// sink that does not finish in time.
    async fn finish(self) {
        let Self { sink, queue, mut task } = self;
        drop(queue);
        if timeout(SINK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!(
                sink = sink.name(),
                "Sink did not finish writing, dropping queued readings"
            );
            task.abort();
        }
    }
}

async fn deliver(sink: Arc<dyn Sink>, mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        let Delivery {
            identity,
            page_name,
            reading,
        } = delivery;
        if let Err(error) = sink.publish(&identity, &page_name, &reading).await {
            warn!(sink = sink.name(), device = %identity, %error, "Sink write failed");
        }
    }
}

pub struct Distributor {
    sinks: Vec<Arc<dyn Sink>>,
    workers: Vec<SinkWorker>,
    shutdown: ShutdownFlag,
    closed: bool,
}

impl Distributor {
    pub fn new(sinks: Vec<Box<dyn Sink>>, shutdown: ShutdownFlag) -> Self {
        Self {
            sinks: sinks.into_iter().map(Arc::from).collect(),
            workers: Vec::new(),
            shutdown,
            closed: false,
        }
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Queue one decoded page for every sink.
    ///
    /// Never waits on a sink. Each sink writes from its own task; a failing
    /// sink is logged there, and a sink whose queue is full loses this reading
    /// without affecting the others. Must be called within a tokio runtime.
    pub fn write_data(&mut self, identity: &DeviceIdentity, page_name: &str, reading: &Reading) {
        if self.closed {
            return;
        }
        if self.workers.is_empty() {
            self.workers = self.sinks.iter().cloned().map(SinkWorker::spawn).collect();
        }

        for worker in &self.workers {
            let delivery = Delivery {
                identity: identity.clone(),
                page_name: page_name.to_string(),
                reading: reading.clone(),
            };
            match worker.queue.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        sink = worker.sink.name(),
                        device = %identity,
                        "Sink queue full, dropping reading"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    error!(sink = worker.sink.name(), "Sink delivery task ended");
                }
            }
        }
    }

    /// Receive and distribute until `stop` resolves or the transport ends,
    /// then shut everything down.
    ///
    /// `workouts` are handed to controllable devices once they are found.
    pub async fn run<S>(
        &mut self,
        transport: &dyn Transport,
        sessions: Vec<DeviceSession>,
        workouts: Option<Vec<Workout>>,
        stop: S,
    ) -> Result<(), TransportError>
    where
        S: Future<Output = ()>,
    {
        let mut sessions = register(sessions);
        if let Some(workouts) = workouts {
            assign_workouts(&mut sessions, workouts);
        }

        let names: Vec<_> = sessions.values().map(|s| s.identity().to_string()).collect();
        info!(devices = ?names, "Starting device data importer, press Ctrl-C to finish");

        let channels = sessions.values().map(DeviceSession::channel_spec).collect();
        let result = match transport.start_receiving(channels).await {
            Ok(mut events) => {
                tokio::pin!(stop);
                loop {
                    tokio::select! {
                        _ = &mut stop => {
                            info!("Closing devices");
                            break;
                        }
                        event = events.recv() => match event {
                            Some(event) => self.dispatch(transport, &mut sessions, event),
                            None => {
                                info!("Transport stopped delivering events");
                                break;
                            }
                        },
                    }
                }
                Ok(())
            }
            Err(error) => Err(error),
        };

        self.shutdown.trigger();
        for session in sessions.values_mut() {
            session.close(transport);
        }
        transport.stop_receiving();
        self.close().await;

        result
    }

    fn dispatch(
        &mut self,
        transport: &dyn Transport,
        sessions: &mut HashMap<DeviceKey, DeviceSession>,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::Found(key) => match sessions.get_mut(&key) {
                Some(session) => {
                    if let Some(workouts) = session.on_found() {
                        let duration: Duration =
                            workouts.iter().map(Workout::total_duration).sum();
                        info!(
                            device = %key,
                            count = workouts.len(),
                            duration_secs = duration.as_secs(),
                            "Starting workouts"
                        );
                        transport.start_workouts(key, workouts);
                    }
                }
                None => debug!(device = %key, "Found event for unknown device"),
            },
            TransportEvent::Payload(key, payload) => match sessions.get_mut(&key) {
                Some(session) => {
                    if let Some(update) = session.on_payload(&payload) {
                        self.write_data(update.identity, update.page_name, update.reading);
                    }
                }
                None => debug!(device = %key, "Payload for unknown device"),
            },
        }
    }

    /// Let every sink finish its queued writes, then close it. Idempotent.
    ///
    /// A sink that does not drain or close within [`SINK_SHUTDOWN_TIMEOUT`]
    /// is abandoned so the others still get closed.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        join_all(self.workers.drain(..).map(SinkWorker::finish)).await;
        join_all(self.sinks.iter().map(|sink| async move {
            if timeout(SINK_SHUTDOWN_TIMEOUT, sink.close()).await.is_err() {
                warn!(sink = sink.name(), "Sink did not close in time");
            }
        }))
        .await;
    }
}

fn register(sessions: Vec<DeviceSession>) -> HashMap<DeviceKey, DeviceSession> {
    let mut table = HashMap::with_capacity(sessions.len());
    for session in sessions {
        let key = session.key();
        if table.contains_key(&key) {
            warn!(device = %key, "Duplicate device configured, ignoring");
            continue;
        }
        table.insert(key, session);
    }
    table
}

fn assign_workouts(sessions: &mut HashMap<DeviceKey, DeviceSession>, workouts: Vec<Workout>) {
    let mut accepted = false;
    for session in sessions.values_mut() {
        accepted |= session.assign_workouts(workouts.clone());
    }
    if !accepted {
        warn!(
            count = workouts.len(),
            "Workouts configured but no device can run them"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        EventLog, FakeTransport, GENERAL_PAGE, MAIN_PAGE, RecordingSink, core_temp_identity,
    };
    use std::time::Duration;

    fn key(device_id: u16) -> DeviceKey {
        core_temp_identity(device_id).key()
    }

    fn sessions(ids: &[u16]) -> Vec<DeviceSession> {
        ids.iter()
            .map(|id| DeviceSession::new(core_temp_identity(*id)))
            .collect()
    }

    #[tokio::test]
    async fn payloads_reach_every_sink() {
        let log = EventLog::default();
        let first = RecordingSink::new("first", log.clone());
        let second = RecordingSink::new("second", log.clone());
        let (first_seen, second_seen) = (first.published(), second.published());

        let transport = FakeTransport::new(vec![
            TransportEvent::Found(key(1)),
            TransportEvent::Payload(key(1), MAIN_PAGE),
            TransportEvent::Payload(key(1), GENERAL_PAGE),
        ]);
        let mut distributor =
            Distributor::new(vec![Box::new(first), Box::new(second)], ShutdownFlag::new());

        distributor
            .run(&transport, sessions(&[1]), None, std::future::pending())
            .await
            .unwrap();

        for seen in [first_seen, second_seen] {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0].device, "core_temp_1");
            assert_eq!(seen[0].page_name, "core_temp");
            assert_eq!(seen[0].fields.len(), 4);
            // General page adds quality while keeping main page fields.
            assert_eq!(seen[1].fields.len(), 5);
        }
    }

    #[tokio::test]
    async fn payloads_are_routed_by_device() {
        let sink = RecordingSink::new("sink", EventLog::default());
        let seen = sink.published();
        let transport = FakeTransport::new(vec![
            TransportEvent::Payload(key(2), MAIN_PAGE),
            TransportEvent::Payload(key(1), GENERAL_PAGE),
            TransportEvent::Payload(key(3), MAIN_PAGE),
        ]);
        let mut distributor = Distributor::new(vec![Box::new(sink)], ShutdownFlag::new());

        distributor
            .run(&transport, sessions(&[1, 2]), None, std::future::pending())
            .await
            .unwrap();

        let devices: Vec<_> = seen.lock().unwrap().iter().map(|p| p.device.clone()).collect();
        assert_eq!(devices, ["core_temp_2", "core_temp_1"]);
        // Device 1 only ever saw its general page.
        assert_eq!(seen.lock().unwrap()[1].fields.len(), 1);
    }

    #[tokio::test]
    async fn unknown_pages_are_not_forwarded() {
        let sink = RecordingSink::new("sink", EventLog::default());
        let seen = sink.published();
        let transport = FakeTransport::new(vec![TransportEvent::Payload(key(1), [0x42; 8])]);
        let mut distributor = Distributor::new(vec![Box::new(sink)], ShutdownFlag::new());

        distributor
            .run(&transport, sessions(&[1]), None, std::future::pending())
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let log = EventLog::default();
        let broken = RecordingSink::failing("broken", log.clone());
        let healthy = RecordingSink::new("healthy", log.clone());
        let seen = healthy.published();
        let transport = FakeTransport::new(vec![
            TransportEvent::Payload(key(1), MAIN_PAGE),
            TransportEvent::Payload(key(1), MAIN_PAGE),
        ]);
        let mut distributor =
            Distributor::new(vec![Box::new(broken), Box::new(healthy)], ShutdownFlag::new());

        distributor
            .run(&transport, sessions(&[1]), None, std::future::pending())
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(log.entries().contains(&"close broken".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sink_does_not_block_delivery_to_others() {
        let log = EventLog::default();
        let hung = RecordingSink::hanging("hung", log.clone());
        let healthy = RecordingSink::new("healthy", log.clone());
        let seen = healthy.published();
        let mut distributor =
            Distributor::new(vec![Box::new(hung), Box::new(healthy)], ShutdownFlag::new());

        let identity = core_temp_identity(1);
        let reading = crate::test_utils::decoded(&[MAIN_PAGE]);
        distributor.write_data(&identity, "core_temp", &reading);
        distributor.write_data(&identity, "core_temp", &reading);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(seen.lock().unwrap().len(), 2);

        let started = tokio::time::Instant::now();
        distributor.close().await;
        assert!(started.elapsed() <= SINK_SHUTDOWN_TIMEOUT + Duration::from_secs(1));
        let mut entries = log.entries();
        entries.sort();
        assert_eq!(entries, ["close healthy", "close hung"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honoured_while_a_sink_hangs() {
        let log = EventLog::default();
        let hung = RecordingSink::hanging("hung", log.clone());
        let healthy = RecordingSink::new("healthy", log.clone());
        let seen = healthy.published();
        let transport = FakeTransport::new(vec![
            TransportEvent::Payload(key(1), MAIN_PAGE),
            TransportEvent::Payload(key(1), MAIN_PAGE),
        ])
        .held_open()
        .with_log(log.clone());
        let mut distributor =
            Distributor::new(vec![Box::new(hung), Box::new(healthy)], ShutdownFlag::new());

        let stop = tokio::time::sleep(Duration::from_secs(1));
        let finished = tokio::time::timeout(
            Duration::from_secs(60),
            distributor.run(&transport, sessions(&[1]), None, stop),
        )
        .await;

        assert!(matches!(finished, Ok(Ok(()))), "stop was not honoured");
        assert_eq!(seen.lock().unwrap().len(), 2);
        let entries = log.entries();
        assert!(entries.contains(&"stop_receiving".to_string()));
        assert!(entries.contains(&"close hung".to_string()));
        assert!(entries.contains(&"close healthy".to_string()));
    }

    #[tokio::test]
    async fn full_queue_drops_readings_for_that_sink_only() {
        let hung = RecordingSink::hanging("hung", EventLog::default());
        let healthy = RecordingSink::new("healthy", EventLog::default());
        let seen = healthy.published();
        let mut distributor =
            Distributor::new(vec![Box::new(hung), Box::new(healthy)], ShutdownFlag::new());

        let identity = core_temp_identity(1);
        let reading = crate::test_utils::decoded(&[MAIN_PAGE]);
        let total = SINK_QUEUE_CAPACITY + 10;
        for _ in 0..total {
            distributor.write_data(&identity, "core_temp", &reading);
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        assert_eq!(seen.lock().unwrap().len(), total);
    }

    #[tokio::test]
    async fn stop_signal_runs_ordered_shutdown() {
        let log = EventLog::default();
        let shutdown = ShutdownFlag::new();
        let sink = RecordingSink::new("sink", log.clone());
        let transport = FakeTransport::new(Vec::new())
            .held_open()
            .with_log(log.clone())
            .observing(shutdown.clone());
        let mut distributor = Distributor::new(vec![Box::new(sink)], shutdown.clone());

        distributor
            .run(&transport, sessions(&[1, 2]), None, async {})
            .await
            .unwrap();

        assert!(shutdown.is_set());
        let mut entries = log.entries();
        // Channel close order follows the registration table; sort that part.
        entries[..2].sort();
        assert_eq!(
            entries,
            [
                "close_channel 127:1 shutdown=true",
                "close_channel 127:2 shutdown=true",
                "stop_receiving",
                "close sink",
            ]
        );
    }

    #[tokio::test]
    async fn transport_start_failure_still_closes_sinks() {
        let log = EventLog::default();
        let sink = RecordingSink::new("sink", log.clone());
        let transport = FakeTransport::new(Vec::new()).with_log(log.clone()).failing();
        let mut distributor = Distributor::new(vec![Box::new(sink)], ShutdownFlag::new());

        let result = distributor
            .run(&transport, sessions(&[1]), None, std::future::pending())
            .await;

        assert!(matches!(result, Err(TransportError::AlreadyStarted)));
        assert!(distributor.shutdown_flag().is_set());
        assert_eq!(log.entries().last().map(String::as_str), Some("close sink"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let log = EventLog::default();
        let sink = RecordingSink::new("sink", log.clone());
        let mut distributor = Distributor::new(vec![Box::new(sink)], ShutdownFlag::new());

        distributor.close().await;
        distributor.close().await;

        assert_eq!(log.entries(), ["close sink"]);
    }

    #[tokio::test]
    async fn duplicate_devices_are_registered_once() {
        let log = EventLog::default();
        let transport = FakeTransport::new(Vec::new()).with_log(log.clone());
        let mut distributor = Distributor::new(Vec::new(), ShutdownFlag::new());

        distributor
            .run(&transport, sessions(&[4, 4]), None, std::future::pending())
            .await
            .unwrap();

        assert_eq!(log.entries(), ["close_channel 127:4", "stop_receiving"]);
        assert_eq!(transport.started_with().len(), 1);
    }

    #[tokio::test]
    async fn workouts_are_not_sent_to_sensors() {
        let log = EventLog::default();
        let transport =
            FakeTransport::new(vec![TransportEvent::Found(key(1))]).with_log(log.clone());
        let mut distributor = Distributor::new(Vec::new(), ShutdownFlag::new());
        let workout = Workout::from_arrays(&[100], &[10.0], 1, false).unwrap();

        distributor
            .run(
                &transport,
                sessions(&[1]),
                Some(vec![workout]),
                std::future::pending(),
            )
            .await
            .unwrap();

        assert!(!log.entries().iter().any(|e| e.starts_with("workouts")));
    }
}
