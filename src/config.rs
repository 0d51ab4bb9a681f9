//! Typed configuration: a JSON tunables file for the settings an operator
//! edits, environment variables for secrets and endpoints, mirroring
//! `LazyIVQueue/config.py`'s `config.json` + `.env` split.
//!
//! The hot-reloadable subset lives behind an `arc_swap::ArcSwap` so a config
//! reload can publish a new snapshot without taking any component lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::error::ConfigError;

fn default_iv_threshold() -> usize {
    50
}
fn default_cell_threshold() -> usize {
    50
}
fn default_calibration_minutes() -> u64 {
    30
}
fn default_ranking_interval() -> u64 {
    300
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_timeout_iv() -> u64 {
    90
}
fn default_concurrency() -> usize {
    5
}
fn default_geofence_expire() -> u64 {
    3600
}
fn default_geofence_refresh() -> u64 {
    3500
}
fn default_check_interval_ms() -> u64 {
    500
}
fn default_janitor_interval_secs() -> u64 {
    30
}

/// Shape of the on-disk JSON tunables file.
#[derive(Debug, Clone, Deserialize)]
pub struct TunablesFile {
    #[serde(default)]
    pub priority_list: Vec<String>,
    #[serde(default)]
    pub cell_list: Vec<String>,
    #[serde(default = "default_iv_threshold")]
    pub iv_threshold: usize,
    #[serde(default = "default_cell_threshold")]
    pub cell_threshold: usize,
    #[serde(default = "default_calibration_minutes")]
    pub calibration_minutes: u64,
    #[serde(default = "default_ranking_interval")]
    pub ranking_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_timeout_iv")]
    pub timeout_iv: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency_scout: usize,
    #[serde(default = "default_geofence_expire")]
    pub geofence_expire_cache_seconds: u64,
    #[serde(default = "default_geofence_refresh")]
    pub geofence_refresh_cache_seconds: u64,
    #[serde(default)]
    pub filter_with_koji: bool,
    #[serde(default)]
    pub rarity_enabled: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub header_auth: Option<String>,
    #[serde(default = "default_check_interval_ms")]
    pub dispatcher_check_interval_ms: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_seconds: u64,
}

impl Default for TunablesFile {
    fn default() -> Self {
        TunablesFile {
            priority_list: Vec::new(),
            cell_list: Vec::new(),
            iv_threshold: default_iv_threshold(),
            cell_threshold: default_cell_threshold(),
            calibration_minutes: default_calibration_minutes(),
            ranking_interval_seconds: default_ranking_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            timeout_iv: default_timeout_iv(),
            concurrency_scout: default_concurrency(),
            geofence_expire_cache_seconds: default_geofence_expire(),
            geofence_refresh_cache_seconds: default_geofence_refresh(),
            filter_with_koji: false,
            rarity_enabled: false,
            allowed_ips: Vec::new(),
            header_auth: None,
            dispatcher_check_interval_ms: default_check_interval_ms(),
            janitor_interval_seconds: default_janitor_interval_secs(),
        }
    }
}

/// An ordered species list (`priority_list` or `cell_list`) plus its
/// position index, so a species lookup is O(1).
#[derive(Debug, Clone, Default)]
pub struct SpeciesList {
    index: HashMap<String, usize>,
}

impl SpeciesList {
    fn from_ordered(entries: &[String]) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (pos, key) in entries.iter().enumerate() {
            index.entry(key.clone()).or_insert(pos);
        }
        SpeciesList { index }
    }

    /// Looks up `species_id[:form]` first, then the any-form key, returning
    /// the list position (Tier-0 priority value) on a hit.
    pub fn position(&self, species_id: i64, form: Option<i64>) -> Option<usize> {
        if let Some(form) = form {
            let exact = format!("{species_id}:{form}");
            if let Some(pos) = self.index.get(&exact) {
                return Some(*pos);
            }
        }
        self.index.get(&species_id.to_string()).copied()
    }
}

/// The hot-reloadable subset of configuration.
#[derive(Debug, Clone)]
pub struct ReloadableConfig {
    pub priority_list: SpeciesList,
    pub cell_list: SpeciesList,
    pub iv_threshold: usize,
    pub cell_threshold: usize,
    pub calibration_minutes: u64,
    pub ranking_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub timeout_iv: u64,
    pub concurrency_scout: usize,
    pub geofence_expire_cache_seconds: u64,
    pub geofence_refresh_cache_seconds: u64,
    pub dispatcher_check_interval_ms: u64,
    pub janitor_interval_seconds: u64,
}

impl From<&TunablesFile> for ReloadableConfig {
    fn from(f: &TunablesFile) -> Self {
        ReloadableConfig {
            priority_list: SpeciesList::from_ordered(&f.priority_list),
            cell_list: SpeciesList::from_ordered(&f.cell_list),
            iv_threshold: f.iv_threshold,
            cell_threshold: f.cell_threshold,
            calibration_minutes: f.calibration_minutes,
            ranking_interval_seconds: f.ranking_interval_seconds,
            cleanup_interval_seconds: f.cleanup_interval_seconds,
            timeout_iv: f.timeout_iv,
            concurrency_scout: f.concurrency_scout,
            geofence_expire_cache_seconds: f.geofence_expire_cache_seconds,
            geofence_refresh_cache_seconds: f.geofence_refresh_cache_seconds,
            dispatcher_check_interval_ms: f.dispatcher_check_interval_ms,
            janitor_interval_seconds: f.janitor_interval_seconds,
        }
    }
}

/// Scout Service auth: any combination of Basic / Bearer / API key.
#[derive(Debug, Clone, Default)]
pub struct ScoutAuth {
    pub basic: Option<(String, String)>,
    pub bearer: Option<String>,
    pub api_key: Option<String>,
}

/// Restart-only configuration: changing these requires a process restart.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub listen_addr: std::net::SocketAddr,
    pub scout_base_url: String,
    pub scout_username: String,
    pub scout_auth: ScoutAuth,
    pub geofence_base_url: Option<String>,
    pub geofence_project: Option<String>,
    pub geofence_bearer_token: Option<String>,
    pub filter_with_koji: bool,
    pub rarity_enabled: bool,
    pub allowed_ips: Vec<String>,
    pub header_auth: Option<String>,
    pub general_http_timeout_secs: u64,
    pub geofence_http_timeout_secs: u64,
}

/// The whole configuration: a static part read once, and a live-swappable
/// reloadable part.
pub struct Config {
    pub static_cfg: StaticConfig,
    pub reloadable: ArcSwap<ReloadableConfig>,
    pub(crate) file_path: PathBuf,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_var(name)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn load_tunables(path: &Path) -> Result<TunablesFile, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(TunablesFile::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

impl Config {
    /// Loads the static and initial reloadable configuration from the given
    /// JSON tunables file plus environment secrets/endpoints.
    pub fn load(file_path: PathBuf) -> Result<Self, ConfigError> {
        let tunables = load_tunables(&file_path)?;

        let listen_addr = env_var("LISTEN_ADDR")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8090".parse().unwrap());

        let scout_auth = ScoutAuth {
            basic: match (env_var("SCOUT_BASIC_USER"), env_var("SCOUT_BASIC_PASS")) {
                (Some(u), Some(p)) => Some((u, p)),
                _ => None,
            },
            bearer: env_var("SCOUT_BEARER_TOKEN"),
            api_key: env_var("SCOUT_API_KEY"),
        };

        let static_cfg = StaticConfig {
            listen_addr,
            scout_base_url: env_var("SCOUT_BASE_URL").unwrap_or_default(),
            scout_username: env_var("SCOUT_USERNAME").unwrap_or_default(),
            scout_auth,
            geofence_base_url: env_var("GEOFENCE_BASE_URL"),
            geofence_project: env_var("GEOFENCE_PROJECT"),
            geofence_bearer_token: env_var("GEOFENCE_BEARER_TOKEN"),
            filter_with_koji: tunables.filter_with_koji,
            rarity_enabled: tunables.rarity_enabled,
            allowed_ips: if tunables.allowed_ips.is_empty() {
                env_list("ALLOWED_IPS")
            } else {
                tunables.allowed_ips.clone()
            },
            header_auth: tunables.header_auth.clone().or_else(|| env_var("HEADER_AUTH")),
            general_http_timeout_secs: 20,
            geofence_http_timeout_secs: 15,
        };

        Ok(Config {
            static_cfg,
            reloadable: ArcSwap::from_pointee(ReloadableConfig::from(&tunables)),
            file_path,
        })
    }

    /// Re-reads the tunables file and publishes a new reloadable snapshot.
    /// Returns the previous concurrency value so the caller can detect a
    /// change and propagate it to `PriorityQueue::update_concurrency`.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let tunables = load_tunables(&self.file_path)?;
        let previous_concurrency = self.reloadable.load().concurrency_scout;
        self.reloadable.store(std::sync::Arc::new(ReloadableConfig::from(&tunables)));
        Ok(previous_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn species_list_matches_exact_form_then_any_form() {
        let list = SpeciesList::from_ordered(&["25".into(), "150:0".into()]);
        assert_eq!(list.position(25, None), Some(0));
        assert_eq!(list.position(150, Some(0)), Some(1));
        // Any-form fallback: 150 with a different form still misses, since
        // only "150:0" (not bare "150") is in the list.
        assert_eq!(list.position(150, Some(1)), None);
    }

    #[test]
    fn species_list_any_form_entry_matches_every_form() {
        let list = SpeciesList::from_ordered(&["132".into()]);
        assert_eq!(list.position(132, Some(3)), Some(0));
        assert_eq!(list.position(132, None), Some(0));
    }
}
