//! Recorder actor
//!
//! A single task owns the current reading, the CSV logger, the permission
//! gate and the sensor facade. Triggers, sensor updates and queries all
//! arrive on one channel and are handled one at a time, in arrival order.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::csv_log::{CsvLogger, LogOutcome};
use crate::permissions::{ConfigPermissions, Permission, PermissionGate};
use crate::reading::{Reading, ReadingDisplay};
use crate::sensors::{self, ReadingSource, SensorEvent, SensorFacade, SensorSink, SourceStatus};

const CHANNEL_CAPACITY: usize = 64;

pub const LOCATION_DENIED: &str = "Location permission not granted";
pub const STORAGE_DENIED: &str = "Storage permission not granted";

#[derive(Debug)]
pub enum Event {
    /// The user asked for a reading
    Trigger(oneshot::Sender<TriggerReport>),
    Snapshot(oneshot::Sender<Snapshot>),
    Sources(oneshot::Sender<Vec<SourceStatus>>),
    Sensor(SensorEvent),
    Shutdown,
}

/// What the displays currently show
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub display: ReadingDisplay,
    pub status: String,
    pub last_line: Option<String>,
    pub log_path: PathBuf,
    pub sources_registered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    /// `None` when nothing was logged because location access is missing
    pub outcome: Option<LogOutcome>,
}

pub struct Recorder {
    reading: Reading,
    status: String,
    logger: CsvLogger,
    gate: Box<dyn PermissionGate>,
    facade: SensorFacade,
    sink: SensorSink,
}

impl Recorder {
    pub fn new(
        logger: CsvLogger,
        gate: Box<dyn PermissionGate>,
        facade: SensorFacade,
        sink: SensorSink,
    ) -> Self {
        Self {
            reading: Reading::default(),
            status: String::new(),
            logger,
            gate,
            facade,
            sink,
        }
    }

    /// Ask for whatever permission is missing
    pub fn startup(&mut self) {
        for permission in [Permission::FineLocation, Permission::StorageWrite] {
            if !self.gate.has(permission) {
                self.gate.request(permission);
            }
        }
    }

    /// Stamp the time, ask for location access if it is missing, subscribe
    /// to the sources on the first permitted trigger, then log.
    pub fn trigger(&mut self) -> Option<LogOutcome> {
        self.reading.touch();

        if !self.gate.has(Permission::FineLocation) {
            self.gate.request(Permission::FineLocation);
        }
        if !self.gate.has(Permission::FineLocation) {
            tracing::warn!("{}", LOCATION_DENIED);
            self.status = LOCATION_DENIED.to_string();
            return None;
        }

        let started = self.facade.register_all(&self.sink);
        if started > 0 {
            tracing::info!("Registered {} sources", started);
        }

        Some(self.log())
    }

    pub fn apply(&mut self, event: SensorEvent) -> LogOutcome {
        match event {
            SensorEvent::Location(fix) => self.reading.location = Some(fix),
            SensorEvent::Signal(signal) => self.reading.signal = Some(signal),
            SensorEvent::Battery(percent) => self.reading.battery_percent = Some(percent),
        }
        self.log()
    }

    fn log(&mut self) -> LogOutcome {
        let outcome = self
            .logger
            .log_if_changed(&self.reading.display(), self.gate.as_mut());

        match outcome {
            LogOutcome::PermissionDenied => self.status = STORAGE_DENIED.to_string(),
            LogOutcome::Appended => self.status.clear(),
            LogOutcome::Duplicate | LogOutcome::Failed => {}
        }
        outcome
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            display: self.reading.display(),
            status: self.status.clone(),
            last_line: self.logger.last_line().map(|l| l.trim_end().to_string()),
            log_path: self.logger.path().to_path_buf(),
            sources_registered: self.facade.is_registered(),
        }
    }

    pub fn sources(&self) -> Vec<SourceStatus> {
        self.facade.status()
    }

    /// Unsubscribe every source
    pub fn teardown(&mut self) {
        self.facade.unregister_all();
    }
}

/// Event loop. Ends on `Shutdown` or once every handle is dropped.
pub async fn run(mut recorder: Recorder, mut rx: mpsc::Receiver<Event>) {
    recorder.startup();

    while let Some(event) = rx.recv().await {
        match event {
            Event::Trigger(reply) => {
                let outcome = recorder.trigger();
                let _ = reply.send(TriggerReport {
                    snapshot: recorder.snapshot(),
                    outcome,
                });
            }
            Event::Snapshot(reply) => {
                let _ = reply.send(recorder.snapshot());
            }
            Event::Sources(reply) => {
                let _ = reply.send(recorder.sources());
            }
            Event::Sensor(event) => {
                recorder.apply(event);
            }
            Event::Shutdown => break,
        }
    }

    recorder.teardown();
    tracing::info!("Recorder stopped");
}

/// Cloneable front end of the recorder task
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Event>,
}

impl RecorderHandle {
    /// Spawn a recorder wired to the sources and output directory in `config`
    pub fn spawn(config: &Config) -> (Self, JoinHandle<()>) {
        let output_dir = config.output_dir();
        tracing::info!("Logging readings to {:?}", output_dir);

        Self::spawn_with(
            CsvLogger::new(output_dir),
            Box::new(ConfigPermissions::from_config(config)),
            sensors::build_sources(config),
        )
    }

    pub fn spawn_with(
        logger: CsvLogger,
        gate: Box<dyn PermissionGate>,
        sources: Vec<Box<dyn ReadingSource>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let recorder = Recorder::new(
            logger,
            gate,
            SensorFacade::new(sources),
            SensorSink::new(&tx),
        );
        let task = tokio::spawn(run(recorder, rx));
        (Self { tx }, task)
    }

    async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> anyhow::Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(event(reply))
            .await
            .map_err(|_| anyhow::anyhow!("Recorder is not running"))?;
        Ok(response.await?)
    }

    /// Press the trigger
    pub async fn trigger(&self) -> anyhow::Result<TriggerReport> {
        self.request(Event::Trigger).await
    }

    pub async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        self.request(Event::Snapshot).await
    }

    pub async fn sources(&self) -> anyhow::Result<Vec<SourceStatus>> {
        self.request(Event::Sources).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }
}
