//! NMEA 0183 serial receiver geolocation source
//!
//! Protocol:
//! - Sentences: `$<talker><type>,<field>,...*<checksum>\r\n`
//! - Checksum: XOR of all bytes between `$` and `*`, two hex digits
//! - `RMC` carries position, speed (knots), course and UTC date/time;
//!   only status `A` (valid) sentences produce a fix
//! - `GGA` carries HDOP; the latest HDOP x 5 m is used as the accuracy
//!   estimate of subsequent fixes

use crate::domain::error::SensorError;
use crate::domain::types::RawFix;
use crate::infra::config::Config;
use crate::services::geolocation::{
    FixFilter, FixResult, FixSubscription, GeolocationSource, WatchOptions,
};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::NaiveDate;
use smallvec::SmallVec;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

const KNOTS_TO_MPS: f64 = 0.514_444;
/// User equivalent range error used to turn HDOP into meters
const UERE_M: f64 = 5.0;
const MAX_SENTENCE_LEN: usize = 128;
const FIX_BUFFER: usize = 16;

/// Log watch failure (cold path)
#[cold]
fn log_watch_failed(device: &str, e: &SensorError) {
    warn!(device = %device, error = %e, "nmea_watch_failed");
}

/// Decoded sentence of interest
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    /// Valid recommended-minimum fix
    Rmc(RawFix),
    /// Fix quality with horizontal dilution of precision
    Gga { hdop: Option<f64> },
    /// Anything else, including void RMC
    Other,
}

/// Strip framing and verify the checksum; returns the sentence body
fn verified_body(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.strip_prefix('$')?;
    let (body, checksum) = rest.split_once('*')?;
    let expected = hex::decode(checksum).ok()?;
    if expected.len() != 1 {
        return None;
    }
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected[0]).then_some(body)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    // Digits and a decimal point only; byte offsets below are char offsets
    if !value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value.get(..dot - 2)?.parse().ok()?;
    let minutes: f64 = value.get(dot - 2..)?.parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// `hhmmss.ss` + `ddmmyy` to epoch milliseconds (UTC)
fn parse_timestamp(time: &str, date: &str) -> Option<u64> {
    if time.len() < 6 || date.len() != 6 {
        return None;
    }
    let hour: u32 = time.get(0..2)?.parse().ok()?;
    let minute: u32 = time.get(2..4)?.parse().ok()?;
    let seconds: f64 = time.get(4..)?.parse().ok()?;
    let day: u32 = date.get(0..2)?.parse().ok()?;
    let month: u32 = date.get(2..4)?.parse().ok()?;
    let year: i32 = date.get(4..6)?.parse().ok()?;

    let millis = (seconds.fract() * 1000.0).round() as u32;
    let datetime = NaiveDate::from_ymd_opt(2000 + year, month, day)?.and_hms_milli_opt(
        hour,
        minute,
        seconds.trunc() as u32,
        millis.min(999),
    )?;
    u64::try_from(datetime.and_utc().timestamp_millis()).ok()
}

fn optional_f64(field: Option<&&str>) -> Option<f64> {
    field.filter(|f| !f.is_empty()).and_then(|f| f.parse().ok())
}

/// Decode one sentence line. `None` for malformed or checksum failures.
pub fn parse_sentence(line: &str) -> Option<Sentence> {
    let body = verified_body(line)?;
    let fields: SmallVec<[&str; 20]> = body.split(',').collect();
    let kind = fields.first()?;
    if kind.len() < 5 {
        return None;
    }

    match kind.get(kind.len() - 3..)? {
        "RMC" => {
            if fields.get(2) != Some(&"A") {
                return Some(Sentence::Other);
            }
            let latitude = parse_coordinate(fields.get(3)?, fields.get(4)?);
            let longitude = parse_coordinate(fields.get(5)?, fields.get(6)?);
            let speed = optional_f64(fields.get(7)).map(|knots| knots * KNOTS_TO_MPS);
            let bearing = optional_f64(fields.get(8));
            let timestamp_ms = parse_timestamp(fields.get(1)?, fields.get(9)?);
            Some(Sentence::Rmc(RawFix {
                latitude,
                longitude,
                accuracy: None,
                speed,
                bearing,
                timestamp_ms,
            }))
        }
        "GGA" => Some(Sentence::Gga { hdop: optional_f64(fields.get(8)) }),
        _ => Some(Sentence::Other),
    }
}

pub struct NmeaSerialSource {
    device: String,
    baud: u32,
    fix_timeout: Duration,
}

impl NmeaSerialSource {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.serial_device().to_string(),
            baud: config.serial_baud(),
            fix_timeout: config.fix_timeout(),
        }
    }
}

#[async_trait]
impl GeolocationSource for NmeaSerialSource {
    fn name(&self) -> &'static str {
        "nmea"
    }

    async fn request_access(&self) -> bool {
        match tokio_serial::new(&self.device, self.baud).open_native_async() {
            Ok(_) => true,
            Err(e) => {
                warn!(device = %self.device, error = %e, "nmea_port_open_failed");
                false
            }
        }
    }

    fn watch(&self, options: &WatchOptions) -> FixSubscription {
        let (tx, rx) = mpsc::channel(FIX_BUFFER);
        let device = self.device.clone();
        let baud = self.baud;
        let fix_timeout = self.fix_timeout;
        let filter = FixFilter::new(options);

        let producer = tokio::spawn(async move {
            let error = match tokio_serial::new(&device, baud).open_native_async() {
                Ok(port) => {
                    info!(device = %device, baud = %baud, "nmea_watch_started");
                    stream_sentences(port, fix_timeout, filter, &tx).await
                }
                Err(e) => SensorError::Unavailable(e.to_string()),
            };
            log_watch_failed(&device, &error);
            let _ = tx.send(Err(error)).await;
        });
        FixSubscription::new(rx, producer)
    }
}

/// Read sentences from `reader`, streaming filtered fixes into `tx` until
/// the reader fails or goes quiet for `fix_timeout`
async fn stream_sentences<R: AsyncRead + Unpin>(
    mut reader: R,
    fix_timeout: Duration,
    mut filter: FixFilter,
    tx: &mpsc::Sender<FixResult>,
) -> SensorError {
    let mut buf = [0u8; 512];
    let mut acc = BytesMut::with_capacity(1024);
    let mut hdop: Option<f64> = None;
    let mut deadline = Instant::now() + fix_timeout;

    loop {
        let n = match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            Ok(Ok(0)) => return SensorError::StreamEnded,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return e.into(),
            Err(_) => return SensorError::Timeout(fix_timeout.as_millis() as u64),
        };
        acc.extend_from_slice(&buf[..n]);

        while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
            let line = acc.split_to(pos + 1);
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            match parse_sentence(line) {
                Some(Sentence::Gga { hdop: value }) => hdop = value,
                Some(Sentence::Rmc(mut fix)) => {
                    fix.accuracy = hdop.map(|h| h * UERE_M);
                    let now = Instant::now();
                    deadline = now + fix_timeout;
                    if !filter.accept(&fix, now) {
                        continue;
                    }
                    if tx.send(Ok(fix)).await.is_err() {
                        debug!("nmea_watch_cancelled");
                        return SensorError::StreamEnded;
                    }
                }
                Some(Sentence::Other) => {}
                None => debug!(line = %line.trim_end(), "nmea_sentence_rejected"),
            }
        }

        if acc.len() > MAX_SENTENCE_LEN {
            debug!(discarded = acc.len(), "nmea_oversized_sentence");
            acc.clear();
        }
    }
}
