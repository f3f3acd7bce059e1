//! Domain models - crossings, positions, decisions and sessions
//!
//! This module contains the canonical data types used throughout the system:
//! - `CrossingRecord` - a monitored rail crossing or draw-bridge
//! - `DirectorySnapshot` - immutable copy of the crossing directory
//! - `ProximityDecision` - nearest crossing, ETA and gate verdict
//! - `LiveSession` - the single ephemeral status surface
//! - `geo` - great-circle distance

pub mod geo;
pub mod types;

pub use types::{
    Authorization, CrossingId, CrossingKind, CrossingRecord, CrossingStatus, DirectorySnapshot,
    Freshness, LiveSession, Location, Position, ProximityDecision, SessionAttributes,
    SessionContent, SessionHandle,
};
