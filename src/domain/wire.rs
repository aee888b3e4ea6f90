//! Wire payloads for the backend REST API and the live push channel
//!
//! REST bodies use camelCase keys (`driverId`), backend list payloads and
//! the location broadcast use snake_case keys (`driver_id`), matching what
//! the backend already speaks.

use crate::domain::types::{LocationSample, TrackingIdentity};
use serde::{Deserialize, Deserializer, Serialize};

/// Database ids come back as JSON numbers; keep them as opaque strings
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl From<IdRepr> for String {
    fn from(id: IdRepr) -> Self {
        match id {
            IdRepr::Text(text) => text,
            IdRepr::Integer(n) => n.to_string(),
            IdRepr::Float(n) => n.to_string(),
        }
    }
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    IdRepr::deserialize(deserializer).map(String::from)
}

fn optional_id_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<IdRepr>::deserialize(deserializer).map(|id| id.map(String::from))
}

/// Driver entry from `GET /drivers/list`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Driver {
    #[serde(deserialize_with = "id_string")]
    pub driver_id: String,
    #[serde(default)]
    pub driver_name: Option<String>,
}

/// Bus entry from `GET /drivers/buses/available`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bus {
    #[serde(deserialize_with = "id_string")]
    pub bus_id: String,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub bus_number: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DriverListResponse {
    pub success: bool,
    #[serde(default)]
    pub drivers: Vec<Driver>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BusListResponse {
    pub success: bool,
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrackingRequest<'a> {
    pub driver_id: &'a str,
    pub bus_id: &'a str,
}

/// Response carrying the server-side session token.
///
/// The session object is opaque to the agent and only forwarded.
#[derive(Debug, Deserialize)]
pub struct SessionResponse {
    pub success: bool,
    #[serde(default)]
    pub session: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTrackingRequest<'a> {
    pub driver_id: &'a str,
}

/// Body of `POST /drivers/update-location`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateRequest {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub bearing: f64,
}

impl LocationUpdateRequest {
    pub fn new(sample: &LocationSample, identity: &TrackingIdentity) -> Self {
        Self {
            driver_id: identity.driver_id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed: sample.wire_speed(),
            bearing: sample.wire_bearing(),
        }
    }
}

/// Generic `{success, message?}` acknowledgement
#[derive(Debug, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `join-driver-room` / `leave-driver-room`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub driver_id: String,
    pub bus_id: String,
}

impl From<&TrackingIdentity> for RoomPayload {
    fn from(identity: &TrackingIdentity) -> Self {
        Self { driver_id: identity.driver_id.clone(), bus_id: identity.bus_id.clone() }
    }
}

/// Payload of `driver-location-update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationBroadcast {
    pub bus_id: String,
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub bearing: f64,
    /// ISO-8601 UTC timestamp of the push
    pub timestamp: String,
    pub accuracy: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RawFix;

    #[test]
    fn test_location_update_body_keys() {
        let fix = RawFix { speed: Some(2.5), accuracy: Some(5.0), ..RawFix::at(12.9, 77.6) };
        let sample = LocationSample::from_fix(&fix).unwrap();
        let body = LocationUpdateRequest::new(&sample, &TrackingIdentity::new("D1", "B1"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "driverId": "D1",
                "latitude": 12.9,
                "longitude": 77.6,
                "speed": 2.5,
                "bearing": 0.0
            })
        );
    }

    #[test]
    fn test_room_payload_keys() {
        let payload = RoomPayload::from(&TrackingIdentity::new("D1", "B1"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"driverId": "D1", "busId": "B1"}));
    }

    #[test]
    fn test_driver_list_tolerates_missing_fields() {
        let json = r#"{"success": true, "drivers": [{"driver_id": "D1"}, {"driver_id": "D2", "driver_name": "Asha"}]}"#;
        let parsed: DriverListResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.drivers.len(), 2);
        assert_eq!(parsed.drivers[1].driver_name.as_deref(), Some("Asha"));
    }

    #[test]
    fn test_numeric_ids_become_strings() {
        let json = r#"{"success": true, "drivers": [{"driver_id": 1, "driver_name": "Asha"}, {"driver_id": "D2"}]}"#;
        let parsed: DriverListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.drivers[0].driver_id, "1");
        assert_eq!(parsed.drivers[1].driver_id, "D2");

        let json = r#"{"success": true, "buses": [{"bus_id": 3, "bus_number": 101, "capacity": 40}, {"bus_id": "B4", "bus_number": null}, {"bus_id": 5}]}"#;
        let parsed: BusListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.buses[0].bus_id, "3");
        assert_eq!(parsed.buses[0].bus_number.as_deref(), Some("101"));
        assert_eq!(parsed.buses[0].capacity, Some(40));
        assert_eq!(parsed.buses[1].bus_number, None);
        assert_eq!(parsed.buses[2].bus_id, "5");
        assert_eq!(parsed.buses[2].bus_number, None);
    }

    #[test]
    fn test_session_response_keeps_opaque_session() {
        let json = r#"{"success": true, "session": {"session_id": 42, "started_at": "2026-10-18T08:00:00Z"}}"#;
        let parsed: SessionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.session.unwrap()["session_id"], 42);
    }
}
