//! gpsd client geolocation source
//!
//! Protocol:
//! - Client sends `?WATCH={"enable":true,"json":true}` after connecting
//! - gpsd streams newline-delimited JSON reports (`VERSION`, `DEVICES`,
//!   `SKY`, `TPV`, ...)
//! - Only `TPV` reports with `mode >= 2` (2D or 3D fix) carry a position
//!
//! A watch fails when the socket closes or no usable fix arrives within
//! `fix_timeout`.

use crate::domain::error::SensorError;
use crate::domain::types::RawFix;
use crate::infra::config::Config;
use crate::services::geolocation::{
    FixFilter, FixResult, FixSubscription, GeolocationSource, WatchOptions,
};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_LINE_LEN: usize = 8192;
const FIX_BUFFER: usize = 16;

/// Log watch failure (cold path)
#[cold]
fn log_watch_failed(addr: &str, e: &SensorError) {
    warn!(addr = %addr, error = %e, "gpsd_watch_failed");
}

/// Subset of a gpsd report we care about
#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    speed: Option<f64>,
    track: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    time: Option<String>,
}

/// Decode one report line into a fix. Non-TPV reports and TPV without a
/// 2D/3D fix yield `None`.
pub fn parse_tpv(line: &[u8]) -> Option<RawFix> {
    let report: GpsdReport = serde_json::from_slice(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }

    let accuracy = report.eph.or(match (report.epx, report.epy) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    });
    let timestamp_ms = report.time.as_deref().and_then(parse_gpsd_time);

    Some(RawFix {
        latitude: report.lat,
        longitude: report.lon,
        accuracy,
        speed: report.speed,
        bearing: report.track,
        timestamp_ms,
    })
}

/// gpsd reports time as RFC 3339 UTC with millisecond precision
fn parse_gpsd_time(time_str: &str) -> Option<u64> {
    let parsed = OffsetDateTime::parse(time_str, &Rfc3339).ok()?;
    u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}

pub struct GpsdSource {
    addr: String,
    fix_timeout: Duration,
}

impl GpsdSource {
    pub fn new(config: &Config) -> Self {
        Self::with_addr(config.gpsd_addr(), config.fix_timeout())
    }

    pub fn with_addr(addr: &str, fix_timeout: Duration) -> Self {
        Self { addr: addr.to_string(), fix_timeout }
    }
}

#[async_trait]
impl GeolocationSource for GpsdSource {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    async fn request_access(&self) -> bool {
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "gpsd_unreachable");
                false
            }
            Err(_) => {
                warn!(addr = %self.addr, "gpsd_dial_timeout");
                false
            }
        }
    }

    fn watch(&self, options: &WatchOptions) -> FixSubscription {
        let (tx, rx) = mpsc::channel(FIX_BUFFER);
        let addr = self.addr.clone();
        let fix_timeout = self.fix_timeout;
        let filter = FixFilter::new(options);

        let producer = tokio::spawn(async move {
            let error = stream_fixes(&addr, fix_timeout, filter, &tx).await;
            log_watch_failed(&addr, &error);
            let _ = tx.send(Err(error)).await;
        });
        FixSubscription::new(rx, producer)
    }
}

/// Stream filtered fixes into `tx` until the watch fails
async fn stream_fixes(
    addr: &str,
    fix_timeout: Duration,
    mut filter: FixFilter,
    tx: &mpsc::Sender<FixResult>,
) -> SensorError {
    let mut stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return SensorError::Unavailable(e.to_string()),
        Err(_) => return SensorError::Unavailable(format!("connect to {} timed out", addr)),
    };
    if let Err(e) = stream.write_all(WATCH_COMMAND).await {
        return e.into();
    }
    info!(addr = %addr, "gpsd_watch_started");

    let mut buf = [0u8; 4096];
    let mut acc = BytesMut::with_capacity(4096);
    let mut deadline = Instant::now() + fix_timeout;

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return SensorError::StreamEnded,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return e.into(),
            Err(_) => return SensorError::Timeout(fix_timeout.as_millis() as u64),
        };
        acc.extend_from_slice(&buf[..n]);

        while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
            let line = acc.split_to(pos + 1);
            let Some(fix) = parse_tpv(&line) else {
                continue;
            };
            let now = Instant::now();
            deadline = now + fix_timeout;
            if !filter.accept(&fix, now) {
                continue;
            }
            if tx.send(Ok(fix)).await.is_err() {
                debug!(addr = %addr, "gpsd_watch_cancelled");
                return SensorError::StreamEnded;
            }
        }

        if acc.len() > MAX_LINE_LEN {
            debug!(discarded = acc.len(), "gpsd_oversized_line");
            acc.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TPV_3D: &str = r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2026-01-05T12:00:00.000Z","ept":0.005,"lat":12.9716,"lon":77.5946,"alt":920.1,"epx":4.2,"epy":5.1,"track":181.5,"speed":8.3}"#;

    fn options() -> WatchOptions {
        WatchOptions { interval: Duration::ZERO, fastest_interval: Duration::ZERO, min_distance_m: 0.0 }
    }

    #[test]
    fn test_parse_tpv() {
        let fix = parse_tpv(TPV_3D.as_bytes()).unwrap();
        assert_eq!(fix.latitude, Some(12.9716));
        assert_eq!(fix.longitude, Some(77.5946));
        assert_eq!(fix.speed, Some(8.3));
        assert_eq!(fix.bearing, Some(181.5));
        assert_eq!(fix.accuracy, Some(5.1));
        assert_eq!(fix.timestamp_ms, Some(1_767_614_400_000));
    }

    #[test]
    fn test_parse_tpv_prefers_eph() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0,"eph":3.5,"epx":9.0}"#;
        assert_eq!(parse_tpv(line.as_bytes()).unwrap().accuracy, Some(3.5));
    }

    #[test]
    fn test_parse_ignores_non_fix_reports() {
        assert!(parse_tpv(br#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_tpv(br#"{"class":"SKY","satellites":[]}"#).is_none());
        assert!(parse_tpv(br#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_tpv(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_watch_streams_fixes_then_fails_on_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut cmd = [0u8; 64];
            let n = socket.read(&mut cmd).await.unwrap();
            assert!(cmd[..n].starts_with(b"?WATCH="));
            socket.write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n").await.unwrap();
            // Split a report across writes
            let (head, tail) = TPV_3D.split_at(40);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(tail.as_bytes()).await.unwrap();
            socket.write_all(b"\n").await.unwrap();
        });

        let source = GpsdSource::with_addr(&addr, Duration::from_secs(5));
        let mut sub = source.watch(&options());
        let fix = sub.next().await.unwrap().unwrap();
        assert_eq!(fix.latitude, Some(12.9716));
        assert_eq!(sub.next().await, Some(Err(SensorError::StreamEnded)));
    }

    #[tokio::test]
    async fn test_watch_times_out_without_fix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"{\"class\":\"TPV\",\"mode\":1}\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let source = GpsdSource::with_addr(&addr, Duration::from_millis(200));
        let mut sub = source.watch(&options());
        assert_eq!(sub.next().await, Some(Err(SensorError::Timeout(200))));
    }

    #[tokio::test]
    async fn test_access_requires_reachable_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(GpsdSource::with_addr(&addr, Duration::from_secs(1)).request_access().await);

        drop(listener);
        assert!(!GpsdSource::with_addr(&addr, Duration::from_secs(1)).request_access().await);
    }
}
