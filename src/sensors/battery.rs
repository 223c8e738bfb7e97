//! Battery charge source

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{ChangeFilter, ReadingSource, SensorEvent, SensorSink, SourceError, SourceKind};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

// === Helper Functions ===

/// Whole charge percentage, clamped to 0-100
pub fn percent_from_charge(percent: f32) -> u8 {
    percent.round().clamp(0.0, 100.0) as u8
}

type ReadReply = oneshot::Sender<Result<Option<u8>, SourceError>>;

/// Charge of the first battery, `None` when the machine has no battery
fn read_percent(manager: &battery::Manager) -> Result<Option<u8>, SourceError> {
    let mut batteries = manager
        .batteries()
        .map_err(|e| SourceError::Unavailable(format!("Failed to get batteries: {}", e)))?;

    match batteries.next() {
        Some(Ok(battery)) => {
            let percent = battery
                .state_of_charge()
                .get::<battery::units::ratio::percent>();
            Ok(Some(percent_from_charge(percent)))
        }
        Some(Err(e)) => Err(SourceError::Unavailable(format!(
            "Failed to read battery: {}",
            e
        ))),
        None => Ok(None),
    }
}

/// Answer read requests until every sender is gone
fn serve_reads<F>(requests: std_mpsc::Receiver<ReadReply>, mut read: F)
where
    F: FnMut() -> Result<Option<u8>, SourceError>,
{
    for reply in requests {
        let _ = reply.send(read());
    }
}

/// Blocking side of the source: one manager for the life of the
/// subscription. Battery reads hit sysfs/IOKit synchronously.
fn battery_worker(requests: std_mpsc::Receiver<ReadReply>) {
    match battery::Manager::new() {
        Ok(manager) => serve_reads(requests, || read_percent(&manager)),
        Err(e) => {
            let msg = format!("Failed to create battery manager: {}", e);
            serve_reads(requests, || Err(SourceError::Unavailable(msg.clone())))
        }
    }
}

// === Source ===

/// Polls the first battery and reports the charge on registration and
/// whenever it changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatterySource;

impl ReadingSource for BatterySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Battery
    }

    fn start(&self, sink: SensorSink) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (requests, rx) = std_mpsc::channel::<ReadReply>();
            tokio::task::spawn_blocking(move || battery_worker(rx));

            let mut filter = ChangeFilter::default();
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            let mut warned = false;

            loop {
                ticker.tick().await;

                let (reply_tx, reply_rx) = oneshot::channel();
                if requests.send(reply_tx).is_err() {
                    tracing::warn!("Battery reader stopped");
                    break;
                }
                let Ok(result) = reply_rx.await else {
                    tracing::warn!("Battery reader stopped");
                    break;
                };

                let percent = match result {
                    Ok(Some(percent)) => percent,
                    Ok(None) => {
                        if !warned {
                            tracing::info!("No batteries detected, battery level stays unset");
                            warned = true;
                        }
                        continue;
                    }
                    Err(e) => {
                        if !warned {
                            tracing::warn!("{}", e);
                            warned = true;
                        }
                        continue;
                    }
                };

                if filter.changed(percent) && !sink.send(SensorEvent::Battery(percent)).await {
                    break;
                }
            }
        })
    }
}
