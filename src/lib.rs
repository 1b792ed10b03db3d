//! # Route Cruise
//!
//! Motion simulation for location-aware device testing: moves a device's
//! reported position either point-to-point ("cruise") or along a
//! multi-waypoint routed path, and reports every state change as an event.
//!
//! This library provides:
//! - Spherical geodesy helpers and a speed-scaled arrival threshold
//! - A per-device cruise scheduler with one cancellable tick loop per device
//! - A route sequencer that feeds routed polylines to the scheduler point by
//!   point, with bridging, looping and rerouting
//! - A non-blocking event bus fanning events out to many subscribers
//!
//! ## Features
//!
//! - **`http`** - Enable the BRouter HTTP routing provider
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use route_cruise::{
//!     PositionSink, Result, SimulationConfig, SimulationEngine, StraightLineProvider,
//! };
//!
//! struct PrintSink;
//!
//! #[async_trait]
//! impl PositionSink for PrintSink {
//!     async fn set_position(&self, device_id: &str, lat: f64, lon: f64) -> Result<()> {
//!         println!("{device_id}: {lat:.6},{lon:.6}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let engine = SimulationEngine::new(
//!     Arc::new(PrintSink),
//!     Arc::new(StraightLineProvider),
//!     SimulationConfig::default(),
//! )?;
//!
//! let routes = engine.routes();
//! routes.add_waypoint("device-1", 25.0330, 121.5654).await?;
//! routes.add_waypoint("device-1", 25.0478, 121.5170).await?;
//! routes.start_route_cruise("device-1", 30.0).await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, SimError};

// Engine and routing backend configuration
pub mod config;
pub use config::{BrouterConfig, SimulationConfig};

// Geographic utilities (distance, bearing, projection, arrival threshold)
pub mod geo_utils;

// Events and their fan-out
pub mod events;
pub use events::SimEvent;
pub mod event_bus;
pub use event_bus::{EventBus, Subscription};

// Position sink and routing provider seams
pub mod collaborators;
pub use collaborators::{PositionSink, RoutedPath, RoutingProvider, StraightLineProvider};

// Point-to-point cruise scheduling
pub mod cruise;
pub use cruise::{
    ArrivalCallback, ArrivalOutcome, CruiseScheduler, CruiseSnapshot, CruiseState, CruiseStatus,
};

// Route geometry and route cruising
pub mod route;
pub use route::{Route, RouteSegment, RouteSnapshot, RouteStatus, Waypoint};
pub mod sequencer;
pub use sequencer::RouteSequencer;

// Top-level simulation context
pub mod engine;
pub use engine::SimulationEngine;

// HTTP routing provider
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::BrouterProvider;

// ============================================================================
// Core Types
// ============================================================================

/// A geographic position in degrees.
///
/// # Example
/// ```
/// use route_cruise::Position;
/// let point = Position::new(25.0330, 121.5654); // Taipei
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the position has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Short device id for log lines.
pub(crate) fn device_tag(device_id: &str) -> &str {
    match device_id.char_indices().nth(8) {
        Some((end, _)) => &device_id[..end],
        None => device_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_validation() {
        assert!(Position::new(0.0, 0.0).is_valid());
        assert!(Position::new(90.0, 180.0).is_valid());
        assert!(Position::new(-90.0, -180.0).is_valid());
        assert!(!Position::new(90.1, 0.0).is_valid());
        assert!(!Position::new(0.0, 180.5).is_valid());
        assert!(!Position::new(f64::NAN, 0.0).is_valid());
        assert!(!Position::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_position_json() {
        let json = serde_json::to_string(&Position::new(25.0, 121.5)).unwrap();
        assert_eq!(json, r#"{"latitude":25.0,"longitude":121.5}"#);
    }

    #[test]
    fn test_device_tag() {
        assert_eq!(device_tag("00008110-001A2B3C"), "00008110");
        assert_eq!(device_tag("short"), "short");
        assert_eq!(device_tag(""), "");
    }
}
