//! Services - business logic and state management
//!
//! - `geolocation` - Geolocation source abstraction and fix filtering
//! - `sampler` - Continuous location sampling with automatic restart
//! - `supervisor` - Tracking session: fan-out, lifecycle, recovery

pub mod geolocation;
pub mod sampler;
pub mod supervisor;

// Re-export commonly used types
pub use geolocation::{GeolocationSource, WatchOptions};
pub use sampler::{Sampler, SamplerEvent, SamplerOptions};
pub use supervisor::{SessionDeps, SessionEvent, SessionHandle, SessionSettings, StopOutcome, TrackingSession};
