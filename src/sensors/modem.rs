//! Cellular signal source backed by ModemManager

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use zbus::{
    proxy::Proxy,
    zvariant::{OwnedObjectPath, OwnedValue, Value},
    Connection,
};

use super::{ChangeFilter, ReadingSource, SensorEvent, SensorSink, SourceError, SourceKind};
use crate::reading::SignalStrength;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
const MM_PATH: &str = "/org/freedesktop/ModemManager1";
const MODEM_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem";

// === Helper Functions ===

/// Bucket ModemManager's 0-100 quality into the five signal levels
pub fn level_from_quality(percent: u32) -> u8 {
    match percent {
        0 => 0,
        1..=25 => 1,
        26..=50 => 2,
        51..=75 => 3,
        _ => 4,
    }
}

/// Extract the percentage from the `(ub)` SignalQuality property
fn quality_percent(value: &Value<'_>) -> Option<u32> {
    match value {
        Value::Value(inner) => quality_percent(inner),
        Value::Structure(fields) => match fields.fields().first() {
            Some(Value::U32(percent)) => Some(*percent),
            _ => None,
        },
        _ => None,
    }
}

type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

/// Lowest-numbered modem path. ModemManager numbers modems
/// `.../Modem/<n>`, so `Modem/2` comes before `Modem/10`.
fn pick_modem(paths: impl IntoIterator<Item = String>) -> Option<String> {
    paths.into_iter().min_by_key(|path| {
        let index = path
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(u64::MAX);
        (index, path.clone())
    })
}

/// Object path of the first modem ModemManager knows about
async fn first_modem(conn: &Connection) -> Result<String, SourceError> {
    let proxy = Proxy::new(
        conn,
        MM_SERVICE,
        MM_PATH,
        "org.freedesktop.DBus.ObjectManager",
    )
    .await?;

    let objects: ManagedObjects = proxy.call("GetManagedObjects", &()).await?;
    let modems = objects
        .into_iter()
        .filter(|(_, interfaces)| interfaces.contains_key(MODEM_INTERFACE))
        .map(|(path, _)| path.to_string());
    pick_modem(modems).ok_or_else(|| SourceError::Unavailable("No modem found".to_string()))
}

async fn signal_quality(conn: &Connection, modem: &str) -> Result<u32, SourceError> {
    let proxy = Proxy::new(
        conn,
        MM_SERVICE,
        modem,
        "org.freedesktop.DBus.Properties",
    )
    .await?;

    let value: OwnedValue = proxy.call("Get", &(MODEM_INTERFACE, "SignalQuality")).await?;
    quality_percent(&value)
        .ok_or_else(|| SourceError::Unavailable("Unexpected SignalQuality value".to_string()))
}

// === Source ===

#[derive(Debug, Clone, Copy, Default)]
pub struct ModemManagerSource;

impl ReadingSource for ModemManagerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Signal
    }

    fn start(&self, sink: SensorSink) -> JoinHandle<()> {
        tokio::spawn(async move {
            let conn = match Connection::system().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Failed to connect to system bus: {}", e);
                    return;
                }
            };

            let mut filter = ChangeFilter::default();
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            let mut modem: Option<String> = None;

            loop {
                ticker.tick().await;

                if modem.is_none() {
                    match first_modem(&conn).await {
                        Ok(path) => {
                            tracing::info!("Using modem {}", path);
                            modem = Some(path);
                        }
                        Err(e) => {
                            tracing::debug!("ModemManager: {}", e);
                            continue;
                        }
                    }
                }
                let Some(path) = modem.as_deref() else {
                    continue;
                };

                let signal = match signal_quality(&conn, path).await {
                    Ok(percent) => SignalStrength::Level(level_from_quality(percent)),
                    Err(e) => {
                        tracing::warn!("Failed to read signal quality from {}: {}", path, e);
                        modem = None;
                        continue;
                    }
                };

                if filter.changed(signal) && !sink.send(SensorEvent::Signal(signal)).await {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_quality() {
        assert_eq!(level_from_quality(0), 0);
        assert_eq!(level_from_quality(1), 1);
        assert_eq!(level_from_quality(25), 1);
        assert_eq!(level_from_quality(50), 2);
        assert_eq!(level_from_quality(51), 3);
        assert_eq!(level_from_quality(76), 4);
        assert_eq!(level_from_quality(100), 4);
    }

    #[test]
    fn test_quality_percent() {
        let value = Value::from((42u32, true));
        assert_eq!(quality_percent(&value), Some(42));

        let wrapped = Value::Value(Box::new(value));
        assert_eq!(quality_percent(&wrapped), Some(42));

        assert_eq!(quality_percent(&Value::U32(42)), None);
    }

    #[test]
    fn test_pick_modem_orders_numerically() {
        let paths = [
            "/org/freedesktop/ModemManager1/Modem/10",
            "/org/freedesktop/ModemManager1/Modem/2",
            "/org/freedesktop/ModemManager1/Modem/3",
        ]
        .map(String::from);
        assert_eq!(
            pick_modem(paths).as_deref(),
            Some("/org/freedesktop/ModemManager1/Modem/2")
        );

        assert_eq!(pick_modem(Vec::new()), None);
    }
}
