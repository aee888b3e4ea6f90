//! Domain models - core tracking types and wire payloads
//!
//! This module contains the canonical data types used throughout the agent:
//! - `RawFix` / `LocationSample` - sensor readings before and after validation
//! - `TrackingIdentity` - driver/bus routing keys for a session
//! - `ChannelConnectionState` / `SamplerState` - component lifecycle states
//! - `wire` - REST bodies and live push payloads
//! - `error` - sensor, delivery and channel error types

pub mod error;
pub mod types;
pub mod wire;

// Re-export commonly used types at module level
pub use error::{ChannelError, DeliveryError, SensorError};
pub use types::{
    epoch_ms, ChannelConnectionState, LocationSample, RawFix, SamplerState, SessionStatistics,
    TrackingIdentity,
};
