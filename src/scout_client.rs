//! Typed client for the Scout Service's `/scout/v2` endpoint.
//!
//! Grounded on `LazyIVQueue/DragoniteAPI/utils/http_api.py` and
//! `DragoniteAPI/endpoints/scout.py` (`scout_single` / `scout_v2`),
//! reimplemented as a `reqwest`-backed client shared via `Arc`.

use std::time::Duration;

use serde::Serialize;

use crate::config::ScoutAuth;
use crate::error::ScoutError;

/// Default per-request scout options, matching spec §6.2.
#[derive(Debug, Serialize)]
struct ScoutOptions {
    pokemon: bool,
    pokemon_encounter_radius: u32,
    gmf: bool,
    routes: bool,
    showcases: bool,
}

impl Default for ScoutOptions {
    fn default() -> Self {
        ScoutOptions { pokemon: true, pokemon_encounter_radius: 70, gmf: false, routes: false, showcases: false }
    }
}

#[derive(Debug, Serialize)]
struct ScoutRequest {
    username: String,
    locations: Vec<(f64, f64)>,
    options: ScoutOptions,
}

fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

/// Shared client for dispatching scout requests. `reqwest::Client` is
/// already internally `Arc`-backed, so this is cheap to clone.
#[derive(Clone)]
pub struct ScoutClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    auth: ScoutAuth,
}

impl ScoutClient {
    pub fn new(base_url: String, username: String, auth: ScoutAuth, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a static config");
        ScoutClient { http, base_url, username, auth }
    }

    /// Sends a scout request for the given locations (already rounded to 5
    /// decimal places). A non-2xx response or transport failure is returned
    /// as a `ScoutError`; the caller treats this as a failed scout, never as
    /// a panic.
    pub async fn scout(&self, locations: &[(f64, f64)]) -> Result<(), ScoutError> {
        let body = ScoutRequest {
            username: self.username.clone(),
            locations: locations.iter().map(|(lat, lon)| (round5(*lat), round5(*lon))).collect(),
            options: ScoutOptions::default(),
        };

        let url = format!("{}/scout/v2", self.base_url.trim_end_matches('/'));
        let mut req = self.http.post(&url).json(&body);
        if let Some((user, pass)) = &self.auth.basic {
            req = req.basic_auth(user, Some(pass));
        }
        if let Some(token) = &self.auth.bearer {
            req = req.bearer_auth(token);
        }
        if let Some(key) = &self.auth.api_key {
            req = req.header("X-API-Key", key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ScoutError::Status(resp.status()));
        }
        Ok(())
    }

    /// Convenience for a single-location scout (wild / nearby_stop sightings).
    pub async fn scout_single(&self, lat: f64, lon: f64) -> Result<(), ScoutError> {
        self.scout(&[(lat, lon)]).await
    }
}
