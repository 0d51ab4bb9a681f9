//! Maps coordinates to named areas using polygons fetched from a GeoJSON
//! feature collection and refreshed on a timer.
//!
//! Grounded on `LazyIVQueue/utils/koji_geofences.py` (`KojiGeofenceManager`):
//! Shapely's `Polygon` / `prep` / `Point.contains` become the `geo` crate's
//! `Polygon` / `Point` / `Contains`; `geojson` parses the fetched feature
//! collection into `geo_types` geometry the same way `meilisearch`'s geo
//! indexing pipeline does (`geojson::GeoJson` -> `geo_types::Geometry`).

use std::sync::RwLock;
use std::time::Duration;

use geo::{Contains, Coord, LineString, Point, Polygon};
use geojson::{GeoJson, Value as GeoJsonValue};

use crate::error::GeofenceError;

struct GeofenceArea {
    name: String,
    polygon: Polygon<f64>,
}

/// Resolves coordinates to area names using a periodically-refreshed set of
/// polygons. Startup fetch failure, or an empty configured source, leaves
/// the resolver with an empty set; `resolve` then always returns `None`.
pub struct GeofenceResolver {
    areas: RwLock<Vec<GeofenceArea>>,
    client: reqwest::Client,
    base_url: Option<String>,
    project: Option<String>,
    bearer_token: Option<String>,
}

fn exterior_ring(coords: &[Vec<f64>]) -> Option<LineString<f64>> {
    if coords.len() < 3 {
        return None;
    }
    let mut points: Vec<Coord<f64>> =
        coords.iter().filter_map(|c| Some(Coord { x: *c.first()?, y: *c.get(1)? })).collect();
    if points.len() < 3 {
        return None;
    }
    // Repair an unclosed ring by closing it, the cheap equivalent of
    // Shapely's `buffer(0)` for the "forgot to repeat the first vertex" case.
    if points.first() != points.last() {
        points.push(points[0]);
    }
    Some(LineString::new(points))
}

fn feature_name(feature: &geojson::Feature, fallback: usize) -> String {
    feature
        .properties
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| feature.id.as_ref().map(|id| format!("{id:?}")))
        .unwrap_or_else(|| format!("area_{fallback}"))
}

fn parse_feature_collection(root: &serde_json::Value) -> Vec<GeofenceArea> {
    // Tolerate both a bare FeatureCollection and one nested under "data".
    let candidate = root.get("data").unwrap_or(root);
    let Ok(geojson) = GeoJson::from_json_value(candidate.clone()) else {
        tracing::warn!("geofence source did not return valid GeoJSON");
        return Vec::new();
    };

    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => Vec::new(),
    };

    let mut areas = Vec::with_capacity(features.len());
    for (idx, feature) in features.iter().enumerate() {
        let Some(geometry) = &feature.geometry else { continue };
        let GeoJsonValue::Polygon(rings) = &geometry.value else { continue };
        let Some(exterior) = rings.first().and_then(|ring| exterior_ring(ring)) else { continue };
        let name = feature_name(feature, idx);
        areas.push(GeofenceArea { name, polygon: Polygon::new(exterior, Vec::new()) });
    }
    areas
}

impl GeofenceResolver {
    pub fn new(
        base_url: Option<String>,
        project: Option<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a static config");
        GeofenceResolver { areas: RwLock::new(Vec::new()), client, base_url, project, bearer_token }
    }

    /// Returns the name of the first polygon containing the point, if any.
    pub fn resolve(&self, lat: f64, lon: f64) -> Option<String> {
        let areas = self.areas.read().expect("geofence lock poisoned");
        let point = Point::new(lon, lat);
        areas.iter().find(|a| a.polygon.contains(&point)).map(|a| a.name.clone())
    }

    pub fn area_count(&self) -> usize {
        self.areas.read().expect("geofence lock poisoned").len()
    }

    /// Fetches and atomically swaps in a new polygon set. On any fetch or
    /// parse error the previous set is retained and the error is returned
    /// for the caller to log; `resolve` never returns `None` purely because
    /// of staleness.
    pub async fn refresh(&self) -> Result<(), GeofenceError> {
        let (base, project) = match (&self.base_url, &self.project) {
            (Some(b), Some(p)) => (b, p),
            _ => return Err(GeofenceError::NoUrlConfigured),
        };
        let url = format!("{base}/api/v1/geofence/feature-collection/{project}");
        let mut req = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(GeofenceError::Status(resp.status()));
        }
        let body: serde_json::Value = resp.json().await?;
        let new_areas = parse_feature_collection(&body);

        tracing::info!(area_count = new_areas.len(), "geofence set refreshed");
        *self.areas.write().expect("geofence lock poisoned") = new_areas;
        Ok(())
    }

    /// Spawns the refresh loop. `refresh_period` is read fresh before every
    /// sleep rather than fixed at startup, so a hot-reloaded
    /// `geofence_refresh_cache_seconds` takes effect on the next cycle
    /// without a restart.
    pub fn spawn_background(
        self: std::sync::Arc<Self>,
        refresh_period: impl Fn() -> Duration + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh_period()).await;
                if let Err(err) = self.refresh().await {
                    tracing::error!(%err, "geofence refresh failed, retaining previous set");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_geojson() -> serde_json::Value {
        serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"name": "square"},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0], [0.0, 0.0]]]
                }
            }]
        })
    }

    #[test]
    fn resolve_returns_none_when_empty() {
        let resolver = GeofenceResolver::new(None, None, None, Duration::from_secs(1));
        assert_eq!(resolver.resolve(1.0, 1.0), None);
    }

    #[test]
    fn parse_and_resolve_inside_polygon() {
        let areas = parse_feature_collection(&square_geojson());
        assert_eq!(areas.len(), 1);
        let resolver = GeofenceResolver::new(None, None, None, Duration::from_secs(1));
        *resolver.areas.write().unwrap() = areas;
        // lat=5, lon=5 is inside the square (x=lon, y=lat).
        assert_eq!(resolver.resolve(5.0, 5.0), Some("square".to_string()));
        assert_eq!(resolver.resolve(50.0, 50.0), None);
    }

    #[test]
    fn nested_data_key_is_tolerated() {
        let nested = serde_json::json!({ "data": square_geojson() });
        let areas = parse_feature_collection(&nested);
        assert_eq!(areas.len(), 1);
    }

    #[test]
    fn non_polygon_features_are_ignored() {
        let point_only = serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}
            }]
        });
        assert!(parse_feature_collection(&point_only).is_empty());
    }
}
