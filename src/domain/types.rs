//! Shared types for the tracking agent

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch milliseconds
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// One raw position reading as reported by a geolocation source.
///
/// Every field is optional: sensors routinely report partial fixes (no
/// course while stationary, no accuracy estimate, ...). Coordinates are
/// validated when the fix is turned into a [`LocationSample`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Horizontal accuracy radius in meters
    pub accuracy: Option<f64>,
    /// Ground speed in m/s
    pub speed: Option<f64>,
    /// Course over ground in degrees
    pub bearing: Option<f64>,
    /// Capture time reported by the sensor (epoch ms)
    pub timestamp_ms: Option<u64>,
}

impl RawFix {
    /// Fix with coordinates only
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self { latitude: Some(latitude), longitude: Some(longitude), ..Default::default() }
    }

    /// Coordinates, if both are present and finite
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

/// A validated, normalized fix ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub captured_at_ms: u64,
}

impl LocationSample {
    /// Normalize a raw fix.
    ///
    /// Returns `None` when latitude or longitude is missing or not finite.
    /// Optional measurements that are not finite are treated as unknown.
    /// Missing sensor timestamps fall back to the local clock.
    pub fn from_fix(fix: &RawFix) -> Option<Self> {
        let (latitude, longitude) = fix.coordinates()?;
        Some(Self {
            latitude,
            longitude,
            accuracy: finite(fix.accuracy),
            speed_mps: finite(fix.speed),
            bearing_deg: finite(fix.bearing),
            captured_at_ms: fix.timestamp_ms.unwrap_or_else(epoch_ms),
        })
    }

    /// Speed as sent on the wire (unknown → 0)
    pub fn wire_speed(&self) -> f64 {
        self.speed_mps.unwrap_or(0.0)
    }

    /// Bearing as sent on the wire (unknown → 0)
    pub fn wire_bearing(&self) -> f64 {
        self.bearing_deg.unwrap_or(0.0)
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Driver/bus pair a tracking session is bound to.
///
/// Both identifiers are opaque and forwarded verbatim to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingIdentity {
    pub driver_id: String,
    pub bus_id: String,
}

impl TrackingIdentity {
    pub fn new(driver_id: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self { driver_id: driver_id.into(), bus_id: bus_id.into() }
    }
}

impl std::fmt::Display for TrackingIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.driver_id, self.bus_id)
    }
}

/// Live push channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ChannelConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelConnectionState::Disconnected => "disconnected",
            ChannelConnectionState::Connecting => "connecting",
            ChannelConnectionState::Connected => "connected",
        }
    }

    /// Gauge value for metrics export
    pub fn as_gauge(&self) -> u64 {
        match self {
            ChannelConnectionState::Disconnected => 0,
            ChannelConnectionState::Connecting => 1,
            ChannelConnectionState::Connected => 2,
        }
    }
}

/// Sampler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerState {
    #[default]
    Idle,
    Active,
    Restarting,
}

impl SamplerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerState::Idle => "idle",
            SamplerState::Active => "active",
            SamplerState::Restarting => "restarting",
        }
    }
}

/// Sampling activity of a session, accumulated from sampler output only
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatistics {
    pub sample_count: u64,
    pub last_update_ms: Option<u64>,
    pub started_at_ms: u64,
}

impl SessionStatistics {
    pub fn new(started_at_ms: u64) -> Self {
        Self { sample_count: 0, last_update_ms: None, started_at_ms }
    }

    pub fn record(&mut self, sample: &LocationSample) {
        self.sample_count += 1;
        self.last_update_ms = Some(sample.captured_at_ms);
    }

    /// Session duration formatted as HH:MM:SS
    pub fn elapsed_hms(&self, now_ms: u64) -> String {
        let elapsed = now_ms.saturating_sub(self.started_at_ms) / 1000;
        format!("{:02}:{:02}:{:02}", elapsed / 3600, (elapsed % 3600) / 60, elapsed % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_from_valid_fix() {
        let fix = RawFix {
            latitude: Some(12.9),
            longitude: Some(77.6),
            accuracy: Some(5.0),
            speed: Some(2.5),
            bearing: None,
            timestamp_ms: Some(1_767_617_600_000),
        };
        let sample = LocationSample::from_fix(&fix).unwrap();
        assert_eq!(sample.latitude, 12.9);
        assert_eq!(sample.longitude, 77.6);
        assert_eq!(sample.accuracy, Some(5.0));
        assert_eq!(sample.wire_speed(), 2.5);
        assert_eq!(sample.wire_bearing(), 0.0);
        assert_eq!(sample.captured_at_ms, 1_767_617_600_000);
    }

    #[test]
    fn test_sample_rejects_invalid_coordinates() {
        let bad = [
            RawFix { latitude: None, longitude: Some(77.6), ..Default::default() },
            RawFix { latitude: Some(12.9), longitude: None, ..Default::default() },
            RawFix::at(f64::NAN, 77.6),
            RawFix::at(12.9, f64::INFINITY),
            RawFix::at(f64::NEG_INFINITY, f64::NAN),
        ];
        for fix in &bad {
            assert!(LocationSample::from_fix(fix).is_none(), "accepted {:?}", fix);
        }
    }

    #[test]
    fn test_non_finite_measurements_become_unknown() {
        let fix = RawFix { speed: Some(f64::NAN), accuracy: Some(f64::INFINITY), ..RawFix::at(1.0, 2.0) };
        let sample = LocationSample::from_fix(&fix).unwrap();
        assert_eq!(sample.speed_mps, None);
        assert_eq!(sample.accuracy, None);
        assert_eq!(sample.wire_speed(), 0.0);
    }

    #[test]
    fn test_missing_timestamp_uses_clock() {
        let before = epoch_ms();
        let sample = LocationSample::from_fix(&RawFix::at(1.0, 2.0)).unwrap();
        assert!(sample.captured_at_ms >= before);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(TrackingIdentity::new("D1", "B1").to_string(), "D1-B1");
    }

    #[test]
    fn test_statistics_record_and_elapsed() {
        let mut stats = SessionStatistics::new(1_000);
        let sample = LocationSample::from_fix(&RawFix { timestamp_ms: Some(5_000), ..RawFix::at(1.0, 2.0) }).unwrap();
        stats.record(&sample);
        stats.record(&sample);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.last_update_ms, Some(5_000));
        assert_eq!(stats.elapsed_hms(1_000 + 3_723_000), "01:02:03");
        assert_eq!(stats.elapsed_hms(0), "00:00:00");
    }
}
