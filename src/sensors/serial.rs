//! Cellular signal source for a GSM modem's AT command port
//!
//! Polls `AT+CSQ` and reports the raw RSSI as GSM signal strength (ASU).

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

use super::{ChangeFilter, ReadingSource, SensorEvent, SensorSink, SourceError, SourceKind};
use crate::reading::SignalStrength;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// RSSI from a `+CSQ: <rssi>,<ber>` response; 99 (unknown) yields `None`
pub fn parse_csq(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("+CSQ:")?;
    let rssi: u8 = rest.split(',').next()?.trim().parse().ok()?;
    (rssi <= 31).then_some(rssi)
}

/// Read response lines up to the final `OK`/`ERROR`
async fn read_csq<R>(lines: &mut Lines<R>) -> Result<Option<u8>, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut rssi = None;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.starts_with("+CSQ:") {
            rssi = parse_csq(line);
        } else if line == "OK" || line.contains("ERROR") {
            return Ok(rssi);
        }
    }
    Err(SourceError::Unavailable("Serial port closed".to_string()))
}

#[derive(Debug, Clone)]
pub struct SerialSource {
    device: String,
    baud: u32,
}

impl SerialSource {
    pub fn new(device: &str, baud: u32) -> Self {
        Self {
            device: device.to_string(),
            baud,
        }
    }
}

impl ReadingSource for SerialSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Signal
    }

    fn start(&self, sink: SensorSink) -> JoinHandle<()> {
        let device = self.device.clone();
        let baud = self.baud;
        tokio::spawn(async move {
            let port = match tokio_serial::new(&device, baud).open_native_async() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("{}", SourceError::from(e));
                    return;
                }
            };
            tracing::info!("Polling signal strength on {}", device);

            let (reader, mut writer) = tokio::io::split(port);
            let mut lines = BufReader::new(reader).lines();
            let mut filter = ChangeFilter::default();
            let mut ticker = tokio::time::interval(POLL_INTERVAL);

            loop {
                ticker.tick().await;

                if let Err(e) = writer.write_all(b"AT+CSQ\r").await {
                    tracing::warn!("Failed to write to {}: {}", device, e);
                    break;
                }

                let rssi = match tokio::time::timeout(RESPONSE_TIMEOUT, read_csq(&mut lines)).await
                {
                    Ok(Ok(Some(rssi))) => rssi,
                    Ok(Ok(None)) => continue,
                    Ok(Err(e)) => {
                        tracing::warn!("{}: {}", device, e);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("No AT+CSQ response from {}", device);
                        continue;
                    }
                };

                let signal = SignalStrength::Gsm { asu: rssi };
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
    fn test_parse_csq() {
        assert_eq!(parse_csq("+CSQ: 10,99"), Some(10));
        assert_eq!(parse_csq("+CSQ: 31,0\r"), Some(31));
        assert_eq!(parse_csq("+CSQ: 99,99"), None);
        assert_eq!(parse_csq("OK"), None);
    }

    #[tokio::test]
    async fn test_read_csq_response() {
        let response: &[u8] = b"AT+CSQ\r\n\r\n+CSQ: 10,99\r\n\r\nOK\r\n";
        let mut lines = BufReader::new(response).lines();
        assert_eq!(read_csq(&mut lines).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_read_csq_error_and_eof() {
        let response: &[u8] = b"+CME ERROR: 10\r\n";
        let mut lines = BufReader::new(response).lines();
        assert_eq!(read_csq(&mut lines).await.unwrap(), None);
        assert!(read_csq(&mut lines).await.is_err());
    }
}
