//! Geolocation source interface
//!
//! A source streams raw fixes (or failures) into a [`FixSubscription`].
//! Dropping the subscription cancels the watch. Sources apply the
//! distance/interval filtering themselves through [`FixFilter`]; the
//! sampler only validates and normalizes what comes out.

use crate::domain::error::SensorError;
use crate::domain::types::RawFix;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum displacement before a new fix is reported
pub const DEFAULT_MIN_DISTANCE_M: f64 = 5.0;

/// Lower bound for the fastest reporting interval
const MIN_FASTEST_INTERVAL: Duration = Duration::from_secs(5);

/// Mean Earth radius used for haversine distance
const EARTH_RADIUS_M: f64 = 6_371_008.8;

pub type FixResult = Result<RawFix, SensorError>;

/// Parameters of a continuous watch
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    /// Nominal reporting cadence
    pub interval: Duration,
    /// Fixes closer together than this are suppressed
    pub fastest_interval: Duration,
    /// Fixes closer than this to the last reported one are suppressed
    pub min_distance_m: f64,
}

impl WatchOptions {
    pub fn new(interval: Duration, min_distance_m: f64) -> Self {
        Self { interval, fastest_interval: MIN_FASTEST_INTERVAL.max(interval / 2), min_distance_m }
    }
}

/// Handle on a running watch
pub struct FixSubscription {
    rx: mpsc::Receiver<FixResult>,
    producer: Option<JoinHandle<()>>,
}

impl FixSubscription {
    /// Subscription fed by a producer task; the task is aborted on drop
    pub fn new(rx: mpsc::Receiver<FixResult>, producer: JoinHandle<()>) -> Self {
        Self { rx, producer: Some(producer) }
    }

    /// Subscription fed by an external sender
    pub fn from_receiver(rx: mpsc::Receiver<FixResult>) -> Self {
        Self { rx, producer: None }
    }

    /// Subscription that fails immediately
    pub fn failed(error: SensorError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(error));
        Self::from_receiver(rx)
    }

    /// Next fix or failure; `None` when the source closed the stream
    pub async fn next(&mut self) -> Option<FixResult> {
        self.rx.recv().await
    }
}

impl Drop for FixSubscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Device capability producing position fixes
#[async_trait]
pub trait GeolocationSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether the device can currently produce fixes (permission, device present)
    async fn request_access(&self) -> bool;

    /// Begin streaming fixes. Must be called from within a tokio runtime.
    fn watch(&self, options: &WatchOptions) -> FixSubscription;
}

/// Great-circle distance in meters
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Throttles fixes on displacement and time
///
/// Only passes a fix when:
/// - At least `fastest_interval` since the last passed fix
/// - Position moved at least `min_distance_m` from the last passed fix
pub struct FixFilter {
    last_position: Option<(f64, f64)>,
    last_passed: Option<Instant>,
    fastest_interval: Duration,
    min_distance_m: f64,
}

impl FixFilter {
    pub fn new(options: &WatchOptions) -> Self {
        Self {
            last_position: None,
            last_passed: None,
            fastest_interval: options.fastest_interval,
            min_distance_m: options.min_distance_m,
        }
    }

    /// Decide whether `fix` should be reported, updating filter state if so.
    /// Fixes without usable coordinates never pass.
    pub fn accept(&mut self, fix: &RawFix, now: Instant) -> bool {
        let Some(position) = fix.coordinates() else {
            return false;
        };

        if let Some(last) = self.last_passed {
            if now.duration_since(last) < self.fastest_interval {
                return false;
            }
        }
        if let Some(last_pos) = self.last_position {
            if haversine_m(last_pos, position) < self.min_distance_m {
                return false;
            }
        }

        self.last_position = Some(position);
        self.last_passed = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_options_fastest_interval() {
        let opts = WatchOptions::new(Duration::from_secs(10), DEFAULT_MIN_DISTANCE_M);
        assert_eq!(opts.fastest_interval, Duration::from_secs(5));

        let opts = WatchOptions::new(Duration::from_secs(30), DEFAULT_MIN_DISTANCE_M);
        assert_eq!(opts.fastest_interval, Duration::from_secs(15));

        let opts = WatchOptions::new(Duration::from_secs(2), DEFAULT_MIN_DISTANCE_M);
        assert_eq!(opts.fastest_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_haversine_known_distance() {
        // One thousandth of a degree of latitude is ~111 m
        let d = haversine_m((12.9, 77.6), (12.901, 77.6));
        assert!((d - 111.2).abs() < 0.5, "got {}", d);
        assert_eq!(haversine_m((12.9, 77.6), (12.9, 77.6)), 0.0);
    }

    #[test]
    fn test_filter_distance_and_time() {
        let opts = WatchOptions::new(Duration::from_secs(10), 5.0);
        let mut filter = FixFilter::new(&opts);
        let t0 = Instant::now();

        assert!(filter.accept(&RawFix::at(12.9, 77.6), t0));
        // Too soon
        assert!(!filter.accept(&RawFix::at(12.91, 77.6), t0 + Duration::from_secs(1)));
        // Late enough but only ~1 m away
        assert!(!filter.accept(&RawFix::at(12.90001, 77.6), t0 + Duration::from_secs(6)));
        // Late enough and far enough
        assert!(filter.accept(&RawFix::at(12.901, 77.6), t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_filter_rejects_missing_coordinates() {
        let opts = WatchOptions::new(Duration::from_secs(10), 5.0);
        let mut filter = FixFilter::new(&opts);
        assert!(!filter.accept(&RawFix::default(), Instant::now()));
        assert!(!filter.accept(&RawFix::at(f64::NAN, 1.0), Instant::now()));
    }

    #[tokio::test]
    async fn test_failed_subscription_yields_error() {
        let mut sub = FixSubscription::failed(SensorError::PermissionDenied);
        assert_eq!(sub.next().await, Some(Err(SensorError::PermissionDenied)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_aborts_producer() {
        let (tx, rx) = mpsc::channel(1);
        let (guard_tx, guard_rx) = tokio::sync::oneshot::channel::<()>();
        let producer = tokio::spawn(async move {
            let _tx = tx;
            let _guard = guard_tx;
            std::future::pending::<()>().await;
        });
        let sub = FixSubscription::new(rx, producer);
        drop(sub);
        // The aborted producer drops its guard without sending
        assert!(guard_rx.await.is_err());
    }
}
