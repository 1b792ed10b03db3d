//! Seams to the outside world: where simulated positions go and where routed
//! paths come from.

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo_utils::{haversine_distance, polyline_length};
use crate::Position;

/// Receives every simulated position for a device.
///
/// Called on every tick (at least 5 Hz). Errors are logged by the caller and
/// the simulation keeps going; the next tick corrects a missed write.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn set_position(&self, device_id: &str, latitude: f64, longitude: f64) -> Result<()>;
}

/// A path between two points as returned by a [`RoutingProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedPath {
    pub polyline: Vec<Position>,
    pub distance_km: f64,
    /// True when the provider gave up and returned a straight line
    pub is_fallback: bool,
}

impl RoutedPath {
    /// Straight two-point line from `start` to `end`, flagged as fallback.
    pub fn straight_line(start: Position, end: Position) -> Self {
        Self {
            distance_km: haversine_distance(&start, &end),
            polyline: vec![start, end],
            is_fallback: true,
        }
    }

    /// Routed path whose distance is the polyline length.
    pub fn from_polyline(polyline: Vec<Position>) -> Self {
        Self {
            distance_km: polyline_length(&polyline),
            polyline,
            is_fallback: false,
        }
    }
}

/// Computes a path between two points.
///
/// Implementations must not fail: on any internal error they return
/// [`RoutedPath::straight_line`].
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn get_route(&self, start: Position, end: Position) -> RoutedPath;
}

/// Provider that always answers with the straight-line fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightLineProvider;

#[async_trait]
impl RoutingProvider for StraightLineProvider {
    async fn get_route(&self, start: Position, end: Position) -> RoutedPath {
        RoutedPath::straight_line(start, end)
    }
}

/// Repair a provider answer that would break the sequencer: fewer than two
/// points, or endpoints that are not finite.
pub(crate) fn sanitize_path(path: RoutedPath, start: Position, end: Position) -> RoutedPath {
    if path.polyline.len() < 2 || path.polyline.iter().any(|p| !p.is_valid()) {
        warn!(
            "[Routing] Provider returned unusable path ({} points), using straight line",
            path.polyline.len()
        );
        return RoutedPath::straight_line(start, end);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_straight_line_provider() {
        let a = Position::new(25.0, 121.5);
        let b = Position::new(25.01, 121.51);
        let path = StraightLineProvider.get_route(a, b).await;

        assert!(path.is_fallback);
        assert_eq!(path.polyline, vec![a, b]);
        assert!((path.distance_km - haversine_distance(&a, &b)).abs() < 1e-12);
    }

    #[test]
    fn test_sanitize_short_path() {
        let a = Position::new(25.0, 121.5);
        let b = Position::new(25.01, 121.51);
        let broken = RoutedPath {
            polyline: vec![a],
            distance_km: 0.0,
            is_fallback: false,
        };
        let fixed = sanitize_path(broken, a, b);
        assert!(fixed.is_fallback);
        assert_eq!(fixed.polyline.len(), 2);

        let good = RoutedPath::from_polyline(vec![a, b]);
        assert_eq!(sanitize_path(good.clone(), a, b), good);
    }
}
