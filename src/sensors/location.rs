//! GPS location source backed by gpsd
//!
//! Speaks the gpsd JSON protocol: enable watching, then read one JSON
//! report per line and keep the `TPV` reports that carry a 2D or 3D fix.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::{ReadingSource, SensorEvent, SensorSink, SourceError, SourceKind};
use crate::reading::Fix;

/// Minimum time between two delivered fixes
pub const MIN_INTERVAL: Duration = Duration::from_millis(5000);
/// Minimum displacement between two delivered fixes
pub const MIN_DISTANCE_M: f64 = 5.0;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Parse one gpsd line; `Some` only for a TPV report with a position
pub fn parse_tpv(line: &str) -> Option<Fix> {
    let report: GpsdReport = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    Some(Fix::new(report.lat?, report.lon?))
}

/// Rate limit for fixes: the first fix passes, later ones pass once
/// `MIN_INTERVAL` elapsed or the position moved `MIN_DISTANCE_M`,
/// whichever comes first.
#[derive(Debug, Default)]
pub struct LocationThrottle {
    last: Option<(Instant, Fix)>,
}

impl LocationThrottle {
    pub fn admit(&mut self, fix: Fix, now: Instant) -> bool {
        if let Some((at, last)) = self.last {
            let elapsed = now.saturating_duration_since(at);
            if elapsed < MIN_INTERVAL && fix.distance_m(&last) < MIN_DISTANCE_M {
                return false;
            }
        }
        self.last = Some((now, fix));
        true
    }
}

#[derive(Debug, Clone)]
pub struct GpsdSource {
    addr: String,
}

impl GpsdSource {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

/// Stream fixes from one gpsd connection. Returns `Ok(false)` once the
/// sink is closed, `Ok(true)` when gpsd hung up.
async fn stream_fixes(
    addr: &str,
    sink: &SensorSink,
    throttle: &mut LocationThrottle,
) -> Result<bool, SourceError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(WATCH_COMMAND).await?;
    tracing::info!("Watching gpsd at {}", addr);

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(fix) = parse_tpv(&line) else {
            continue;
        };
        if !throttle.admit(fix, Instant::now()) {
            continue;
        }
        if !sink.send(SensorEvent::Location(fix)).await {
            return Ok(false);
        }
    }

    Ok(true)
}

impl ReadingSource for GpsdSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Location
    }

    fn start(&self, sink: SensorSink) -> JoinHandle<()> {
        let addr = self.addr.clone();
        tokio::spawn(async move {
            let mut throttle = LocationThrottle::default();
            loop {
                match stream_fixes(&addr, &sink, &mut throttle).await {
                    Ok(false) => break,
                    Ok(true) => tracing::info!("gpsd at {} closed the connection", addr),
                    Err(e) => tracing::warn!("gpsd at {} unavailable: {}", addr, e),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}
