//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `backend` - REST client for the fleet backend (durable channel)
//! - `live_channel` - Reconnecting live push channel and its state machine
//! - `mqtt_push` - MQTT transport for the live channel
//! - `loopback` - In-process live transport for dry runs
//! - `gpsd` - gpsd client geolocation source
//! - `nmea` - NMEA 0183 serial geolocation source
//! - `feed_source` - Host-fed geolocation source
//! - `status_server` - Prometheus metrics and status HTTP endpoint

pub mod backend;
pub mod feed_source;
pub mod gpsd;
pub mod live_channel;
pub mod loopback;
pub mod mqtt_push;
pub mod nmea;
pub mod status_server;

// Re-export commonly used types
pub use backend::{BackendClient, DurableChannel};
pub use feed_source::FeedSource;
pub use gpsd::GpsdSource;
pub use live_channel::{ChannelEvent, LiveChannel, LiveChannelConfig, PushConnector};
pub use loopback::LoopbackConnector;
pub use mqtt_push::MqttConnector;
pub use nmea::NmeaSerialSource;
