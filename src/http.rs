//! HTTP routing provider backed by a BRouter endpoint.
//!
//! Requests a GeoJSON track between two points with:
//! - Connection pooling through a shared reqwest client
//! - Per-request timeout from [`BrouterConfig`]
//! - Retry with exponential backoff (1s, 2s, 4s...) on non-200, timeouts and
//!   transport errors
//! - Straight-line fallback when every attempt fails

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::collaborators::{RoutedPath, RoutingProvider};
use crate::config::BrouterConfig;
use crate::error::{Result, SimError};
use crate::Position;

/// GeoJSON response. Only the first feature's geometry is used.
#[derive(Debug, Deserialize)]
struct GeoJsonResponse {
    #[serde(default)]
    features: Vec<GeoJsonFeature>,
}

#[derive(Debug, Deserialize)]
struct GeoJsonFeature {
    geometry: Option<GeoJsonGeometry>,
}

#[derive(Debug, Deserialize)]
struct GeoJsonGeometry {
    /// `[lon, lat]` or `[lon, lat, elevation]`
    #[serde(default)]
    coordinates: Vec<Vec<f64>>,
}

/// Why one attempt produced no path.
enum Attempt {
    /// Worth another try
    Retry(SimError),
    /// The backend answered but the answer is unusable
    GiveUp(SimError),
}

/// [`RoutingProvider`] that asks a BRouter server for a track.
pub struct BrouterProvider {
    client: Client,
    config: BrouterConfig,
}

impl BrouterProvider {
    pub fn new(config: BrouterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SimError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self { client, config })
    }

    /// Provider configured from the environment (`BROUTER_API_URL`).
    pub fn from_env() -> Result<Self> {
        Self::new(BrouterConfig::from_env())
    }

    async fn fetch_route(&self, start: Position, end: Position) -> Result<Vec<Position>> {
        let lonlats = lonlats_param(start, end);
        let max_retries = self.config.max_retries.max(1);
        let mut last_error = SimError::Http {
            message: "no attempt made".to_string(),
            status_code: None,
        };

        for attempt in 0..max_retries {
            debug!(
                "[Brouter] Request attempt {}/{}",
                attempt + 1,
                max_retries
            );

            match self.attempt(&lonlats).await {
                Ok(path) => return Ok(path),
                Err(Attempt::GiveUp(e)) => return Err(e),
                Err(Attempt::Retry(e)) => {
                    warn!(
                        "[Brouter] {} (attempt {}/{})",
                        e,
                        attempt + 1,
                        max_retries
                    );
                    last_error = e;
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt.min(6))).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn attempt(&self, lonlats: &str) -> std::result::Result<Vec<Position>, Attempt> {
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("lonlats", lonlats),
                ("profile", self.config.profile.as_str()),
                ("alternativeidx", "0"),
                ("format", "geojson"),
            ])
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "Timeout" } else { "Request error" };
                Attempt::Retry(SimError::Http {
                    message: format!("{}: {}", kind, e),
                    status_code: None,
                })
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(Attempt::Retry(SimError::Http {
                message: format!("HTTP {}: {}", status, snippet),
                status_code: Some(status.as_u16()),
            }));
        }

        let body = response.text().await.map_err(|e| {
            Attempt::Retry(SimError::Http {
                message: format!("Body error: {}", e),
                status_code: Some(status.as_u16()),
            })
        })?;

        parse_geojson(&body).map_err(Attempt::GiveUp)
    }
}

#[async_trait]
impl RoutingProvider for BrouterProvider {
    async fn get_route(&self, start: Position, end: Position) -> RoutedPath {
        info!(
            "[Brouter] Requesting route: ({:.5},{:.5}) -> ({:.5},{:.5})",
            start.latitude, start.longitude, end.latitude, end.longitude
        );

        match self.fetch_route(start, end).await {
            Ok(polyline) => {
                let path = RoutedPath::from_polyline(polyline);
                info!(
                    "[Brouter] Route: {} points, {:.2} km",
                    path.polyline.len(),
                    path.distance_km
                );
                path
            }
            Err(e) => {
                warn!("[Brouter] Failed ({}), using straight-line fallback", e);
                RoutedPath::straight_line(start, end)
            }
        }
    }
}

/// BRouter's `lonlats` parameter: `lon,lat|lon,lat`.
fn lonlats_param(start: Position, end: Position) -> String {
    format!(
        "{},{}|{},{}",
        start.longitude, start.latitude, end.longitude, end.latitude
    )
}

/// Extract the first feature's track as positions.
fn parse_geojson(body: &str) -> Result<Vec<Position>> {
    let response: GeoJsonResponse = serde_json::from_str(body).map_err(|e| SimError::Http {
        message: format!("Parse error: {}", e),
        status_code: None,
    })?;

    let coordinates = response
        .features
        .into_iter()
        .next()
        .and_then(|feature| feature.geometry)
        .map(|geometry| geometry.coordinates)
        .unwrap_or_default();

    let polyline: Vec<Position> = coordinates
        .iter()
        .filter(|c| c.len() >= 2)
        .map(|c| Position::new(c[1], c[0]))
        .collect();

    if polyline.len() < 2 {
        return Err(SimError::Http {
            message: format!("Empty track ({} points)", polyline.len()),
            status_code: None,
        });
    }
    Ok(polyline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lonlats_order() {
        let param = lonlats_param(Position::new(25.0, 121.5), Position::new(25.01, 121.51));
        assert_eq!(param, "121.5,25|121.51,25.01");
    }

    #[test]
    fn test_parse_geojson_swaps_axes() {
        let body = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"track-length": "1500"},
                "geometry": {
                    "type": "LineString",
                    "coordinates": [[121.5, 25.0, 12.0], [121.505, 25.005, 14.5], [121.51, 25.01]]
                }
            }]
        }"#;

        let polyline = parse_geojson(body).unwrap();
        assert_eq!(polyline.len(), 3);
        assert_eq!(polyline[0], Position::new(25.0, 121.5));
        assert_eq!(polyline[2], Position::new(25.01, 121.51));
    }

    #[test]
    fn test_parse_geojson_empty_track() {
        assert!(parse_geojson(r#"{"features": []}"#).is_err());
        assert!(parse_geojson(r#"{"features": [{"geometry": {"coordinates": []}}]}"#).is_err());
        assert!(parse_geojson("not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_falls_back() {
        let provider = BrouterProvider::new(BrouterConfig {
            api_url: "http://127.0.0.1:9/brouter".to_string(),
            max_retries: 2,
            timeout_secs: 1,
            ..BrouterConfig::default()
        })
        .unwrap();

        let a = Position::new(25.0, 121.5);
        let b = Position::new(25.01, 121.51);
        let path = provider.get_route(a, b).await;
        assert!(path.is_fallback);
        assert_eq!(path.polyline, vec![a, b]);
    }
}
