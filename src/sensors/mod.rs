//! Sensors module - location, cellular signal and battery sources
//!
//! Each source runs as its own task and pushes typed updates into the
//! recorder's event channel through a [`SensorSink`].

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, SignalBackend, SignalConfig};
use crate::reading::{Fix, SignalStrength};
use crate::recorder::Event;

#[cfg(feature = "battery")]
pub mod battery;
pub mod location;
#[cfg(feature = "modem")]
pub mod modem;
#[cfg(feature = "serial")]
pub mod serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Location,
    Signal,
    Battery,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    Location(Fix),
    Signal(SignalStrength),
    Battery(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "modem")]
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Delivery end handed to a running source.
///
/// Holds only a weak sender so running sources never keep the recorder
/// alive.
#[derive(Debug, Clone)]
pub struct SensorSink {
    tx: mpsc::WeakSender<Event>,
}

impl SensorSink {
    pub fn new(tx: &mpsc::Sender<Event>) -> Self {
        Self { tx: tx.downgrade() }
    }

    /// Deliver an update. Returns false once the recorder is gone and the
    /// source should stop.
    pub async fn send(&self, event: SensorEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(Event::Sensor(event)).await.is_ok()
    }
}

pub trait ReadingSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Subscribe: spawn the task that delivers updates into `sink`
    fn start(&self, sink: SensorSink) -> JoinHandle<()>;
}

/// Passes a value through only when it differs from the previous one
#[derive(Debug)]
pub struct ChangeFilter<T> {
    last: Option<T>,
}

impl<T> Default for ChangeFilter<T> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<T: PartialEq + Copy> ChangeFilter<T> {
    pub fn changed(&mut self, value: T) -> bool {
        if self.last == Some(value) {
            return false;
        }
        self.last = Some(value);
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub registered: bool,
}

/// Owns the configured sources and their running subscriptions
pub struct SensorFacade {
    sources: Vec<Box<dyn ReadingSource>>,
    /// Index into `sources` and the subscription task
    running: Vec<(usize, JoinHandle<()>)>,
}

impl SensorFacade {
    pub fn new(sources: Vec<Box<dyn ReadingSource>>) -> Self {
        Self {
            sources,
            running: Vec::new(),
        }
    }

    /// True while at least one subscription task is alive
    pub fn is_registered(&self) -> bool {
        self.running.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Start every source that has no live subscription, including ones
    /// whose task has exited. Returns the number of sources started.
    pub fn register_all(&mut self, sink: &SensorSink) -> usize {
        self.running.retain(|(_, handle)| !handle.is_finished());

        let mut started = 0;
        for (index, source) in self.sources.iter().enumerate() {
            if self.running.iter().any(|(i, _)| *i == index) {
                continue;
            }
            tracing::info!("Registering {:?} source", source.kind());
            self.running.push((index, source.start(sink.clone())));
            started += 1;
        }
        started
    }

    /// Stop every running subscription
    pub fn unregister_all(&mut self) {
        for (index, handle) in self.running.drain(..) {
            tracing::info!("Unregistering {:?} source", self.sources[index].kind());
            handle.abort();
        }
    }

    pub fn status(&self) -> Vec<SourceStatus> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, source)| SourceStatus {
                kind: source.kind(),
                registered: self
                    .running
                    .iter()
                    .any(|(i, handle)| *i == index && !handle.is_finished()),
            })
            .collect()
    }
}

impl Drop for SensorFacade {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

/// Build the sources enabled by `config`
pub fn build_sources(config: &Config) -> Vec<Box<dyn ReadingSource>> {
    let mut sources: Vec<Box<dyn ReadingSource>> = vec![Box::new(location::GpsdSource::new(
        &config.location.gpsd_addr,
    ))];

    if let Some(source) = signal_source(&config.signal) {
        sources.push(source);
    }

    if config.battery.enabled {
        if let Some(source) = battery_source() {
            sources.push(source);
        }
    }

    sources
}

fn signal_source(config: &SignalConfig) -> Option<Box<dyn ReadingSource>> {
    match config.backend {
        SignalBackend::ModemManager => modem_manager_source(),
        SignalBackend::Serial => serial_source(config),
        SignalBackend::None => None,
    }
}

#[cfg(feature = "modem")]
fn modem_manager_source() -> Option<Box<dyn ReadingSource>> {
    Some(Box::new(modem::ModemManagerSource))
}

#[cfg(not(feature = "modem"))]
fn modem_manager_source() -> Option<Box<dyn ReadingSource>> {
    tracing::warn!("Signal backend \"modem-manager\" needs the `modem` feature; no signal source");
    None
}

#[cfg(feature = "serial")]
fn serial_source(config: &SignalConfig) -> Option<Box<dyn ReadingSource>> {
    Some(Box::new(serial::SerialSource::new(
        &config.serial_device,
        config.serial_baud,
    )))
}

#[cfg(not(feature = "serial"))]
fn serial_source(_config: &SignalConfig) -> Option<Box<dyn ReadingSource>> {
    tracing::warn!("Signal backend \"serial\" needs the `serial` feature; no signal source");
    None
}

#[cfg(feature = "battery")]
fn battery_source() -> Option<Box<dyn ReadingSource>> {
    Some(Box::new(battery::BatterySource))
}

#[cfg(not(feature = "battery"))]
fn battery_source() -> Option<Box<dyn ReadingSource>> {
    tracing::warn!("Battery source needs the `battery` feature");
    None
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Source that emits a fixed list of events, then stays subscribed
    pub struct FakeSource {
        pub kind: SourceKind,
        pub events: Vec<SensorEvent>,
    }

    impl ReadingSource for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn start(&self, sink: SensorSink) -> JoinHandle<()> {
            let events = self.events.clone();
            tokio::spawn(async move {
                for event in events {
                    if !sink.send(event).await {
                        return;
                    }
                }
                std::future::pending::<()>().await;
            })
        }
    }

    /// Source whose subscription ends immediately, like a backend that
    /// cannot reach its device
    pub struct ExitingSource {
        pub kind: SourceKind,
    }

    impl ReadingSource for ExitingSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn start(&self, _sink: SensorSink) -> JoinHandle<()> {
            tokio::spawn(async {})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ExitingSource, FakeSource};
    use super::*;

    fn fake(kind: SourceKind) -> Box<dyn ReadingSource> {
        Box::new(FakeSource {
            kind,
            events: Vec::new(),
        })
    }

    #[test]
    fn test_change_filter() {
        let mut filter = ChangeFilter::default();
        assert!(filter.changed(57u8));
        assert!(!filter.changed(57));
        assert!(filter.changed(56));
        assert!(filter.changed(57));
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_unregister_stops_all() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = SensorSink::new(&tx);
        let mut facade = SensorFacade::new(vec![
            fake(SourceKind::Location),
            fake(SourceKind::Signal),
            fake(SourceKind::Battery),
        ]);

        assert_eq!(facade.register_all(&sink), 3);
        assert_eq!(facade.register_all(&sink), 0);
        assert!(facade.status().iter().all(|s| s.registered));

        facade.unregister_all();
        assert!(!facade.is_registered());
        assert!(facade.status().iter().all(|s| !s.registered));

        // Can subscribe again after teardown
        assert_eq!(facade.register_all(&sink), 3);
    }

    #[tokio::test]
    async fn test_register_restarts_exited_sources() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = SensorSink::new(&tx);
        let mut facade = SensorFacade::new(vec![
            fake(SourceKind::Location),
            Box::new(ExitingSource {
                kind: SourceKind::Signal,
            }),
        ]);

        assert_eq!(facade.register_all(&sink), 2);

        // Let the exiting task finish
        for _ in 0..100 {
            if !facade.status()[1].registered {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let status = facade.status();
        assert!(status[0].registered);
        assert!(!status[1].registered);
        assert!(facade.is_registered());

        // Only the exited source is started again
        assert_eq!(facade.register_all(&sink), 1);
    }

    #[tokio::test]
    async fn test_not_registered_once_every_task_exited() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = SensorSink::new(&tx);
        let mut facade = SensorFacade::new(vec![Box::new(ExitingSource {
            kind: SourceKind::Battery,
        })]);

        assert_eq!(facade.register_all(&sink), 1);
        for _ in 0..100 {
            if !facade.is_registered() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!facade.is_registered());
        assert!(facade.status().iter().all(|s| !s.registered));
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = SensorSink::new(&tx);
        let source = FakeSource {
            kind: SourceKind::Battery,
            events: vec![SensorEvent::Battery(57), SensorEvent::Battery(56)],
        };
        let handle = source.start(sink);

        for expected in [57, 56] {
            match rx.recv().await {
                Some(Event::Sensor(SensorEvent::Battery(p))) => assert_eq!(p, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_sink_closed_when_recorder_gone() {
        let (tx, rx) = mpsc::channel(8);
        let sink = SensorSink::new(&tx);
        drop(rx);
        drop(tx);
        assert!(!sink.send(SensorEvent::Battery(10)).await);
    }

    #[test]
    fn test_build_sources_respects_config() {
        let mut config = Config::default();
        config.signal.backend = SignalBackend::None;
        config.battery.enabled = false;

        let kinds: Vec<_> = build_sources(&config).iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![SourceKind::Location]);
    }
}
