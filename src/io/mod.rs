//! IO modules - external system interfaces
//!
//! - `crossing_api` - HTTP client for the remote crossing service
//! - `session_host` - Host live-session API and the log-rendering host
//! - `mqtt_session` - Live sessions published as retained MQTT messages
//! - `position` - Position sources (programmatic feed, NMEA serial GPS)
//! - `prometheus` - Prometheus metrics and session control HTTP endpoint

pub mod crossing_api;
pub mod mqtt_session;
pub mod position;
pub mod prometheus;
pub mod session_host;

// Re-export commonly used types
pub use crossing_api::{CrossingService, FetchError, HttpCrossingService};
pub use mqtt_session::MqttSessionHost;
pub use position::{NmeaSerialSource, PositionFeed, PositionSource};
pub use session_host::{LogSessionHost, PublishError, SessionHost};
