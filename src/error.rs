//! Unified error handling for the route-cruise library.
//!
//! Every precondition failure in the public API (pausing a cruise that is not
//! running, starting a route with too few waypoints, editing a route while it
//! is being driven) comes back as a `SimError`. Nothing in here is ever raised
//! from inside a tick loop.

use thiserror::Error;

/// Unified error type for cruise and route operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Start and target are closer than the arrival threshold
    #[error("Already at target location ({distance_km:.6} km away)")]
    AlreadyAtTarget { distance_km: f64 },

    /// A coordinate is out of range or not finite
    #[error("Invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    /// No cruise session exists for the device
    #[error("No active cruise for device '{device_id}'")]
    NoActiveCruise { device_id: String },

    /// No route cruise session exists for the device
    #[error("No active route cruise for device '{device_id}'")]
    NoActiveRouteCruise { device_id: String },

    /// Operation is not legal in the session's current state
    #[error("Cannot {action}: session is {state}")]
    InvalidState { action: String, state: String },

    /// Route has fewer than 2 waypoints
    #[error("Route needs at least 2 points, has {waypoint_count}")]
    InsufficientWaypoints { waypoint_count: usize },

    /// Route has waypoints but no segments
    #[error("Route has no segments")]
    NoSegments,

    /// Undo requested on an empty route
    #[error("No waypoint to undo")]
    NothingToUndo,

    /// Route geometry cannot change while it is being driven
    #[error("Cannot modify route for device '{device_id}' while cruising")]
    RouteBusy { device_id: String },

    /// The route changed while a routing request was in flight
    #[error("Route for device '{device_id}' changed during routing, retry the edit")]
    RouteChanged { device_id: String },

    /// Reroute requested after the last segment
    #[error("Route has no remaining segments")]
    NoRemainingSegments,

    /// Position sink rejected an update
    #[error("Failed to set position: {message}")]
    SinkFailed { message: String },

    /// HTTP/API error from a routing backend
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SimError {
    pub(crate) fn invalid_state(action: &str, state: impl std::fmt::Display) -> Self {
        SimError::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }
}

/// Result type alias for route-cruise operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// Extension trait for converting Option to SimError.
pub trait OptionExt<T> {
    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| SimError::Internal {
            message: message.to_string(),
        })
    }
}
