//! Sighting parsing and the dual webhook filter: classifies incoming
//! sightings as queue-feed (enqueue) or queue-match (remove) events.
//!
//! Grounded on `LazyIVQueue/webhook/filter.py` (`PokemonData`,
//! `parse_pokemon_data`, `filter_non_iv_pokemon` / `filter_iv_pokemon`),
//! generalized here to the cell-list and rarity paths spec §4.4 adds on top
//! of the original's plain ivlist/geofence check.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::Config;
use crate::geofence::GeofenceResolver;
use crate::queue::{ListType, PriorityQueue, QueueEntry, SeenType as QueueSeenType};
use crate::rarity::{CensusState, RarityCensus};
use crate::s2grid;

/// Default time-to-live given to an entry with no `disappear_time` in the
/// feed payload. Spec §9 documents this as a deliberate choice, not an
/// oversight.
const DEFAULT_DESPAWN_SECS: u64 = 600;

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// How a sighting was observed. A superset of [`crate::queue::SeenType`]:
/// `Other` sightings are always dropped before reaching the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingSeenType {
    Wild,
    NearbyStop,
    NearbyCell,
    Other,
}

impl SightingSeenType {
    fn parse(raw: &str) -> Self {
        match raw {
            "wild" => SightingSeenType::Wild,
            "nearby_stop" => SightingSeenType::NearbyStop,
            "nearby_cell" => SightingSeenType::NearbyCell,
            _ => SightingSeenType::Other,
        }
    }

    fn to_queue_type(self) -> Option<QueueSeenType> {
        match self {
            SightingSeenType::Wild => Some(QueueSeenType::Wild),
            SightingSeenType::NearbyStop => Some(QueueSeenType::NearbyStop),
            SightingSeenType::NearbyCell => Some(QueueSeenType::NearbyCell),
            SightingSeenType::Other => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSighting {
    pokemon_id: Option<i64>,
    form: Option<i64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    spawnpoint_id: Option<String>,
    encounter_id: Option<String>,
    disappear_time: Option<i64>,
    #[serde(default)]
    seen_type: Option<String>,
    individual_attack: Option<i64>,
    individual_defense: Option<i64>,
    individual_stamina: Option<i64>,
}

/// A single observation parsed from a Sightings Feed webhook message.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub species_id: i64,
    pub form: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub spawnpoint_id: Option<String>,
    pub encounter_id: Option<String>,
    pub despawn_at: Option<u64>,
    pub seen_type: SightingSeenType,
    pub iv_attack: Option<i64>,
    pub iv_defense: Option<i64>,
    pub iv_stamina: Option<i64>,
}

impl Sighting {
    /// Parses a `message` payload from a `{"type": "pokemon", "message": ...}`
    /// webhook event. Returns `None` on any missing required field — the
    /// caller drops the sighting and logs at debug, never at error.
    pub fn parse(value: &serde_json::Value) -> Option<Sighting> {
        let raw: RawSighting = serde_json::from_value(value.clone()).ok()?;
        let species_id = raw.pokemon_id?;
        let lat = raw.latitude?;
        let lon = raw.longitude?;

        Some(Sighting {
            species_id,
            form: raw.form,
            lat,
            lon,
            spawnpoint_id: raw.spawnpoint_id,
            encounter_id: raw.encounter_id,
            despawn_at: raw.disappear_time.map(|t| t.max(0) as u64),
            seen_type: raw.seen_type.as_deref().map(SightingSeenType::parse).unwrap_or(SightingSeenType::Other),
            iv_attack: raw.individual_attack,
            iv_defense: raw.individual_defense,
            iv_stamina: raw.individual_stamina,
        })
    }

    pub fn has_iv(&self) -> bool {
        self.iv_attack.is_some() && self.iv_defense.is_some() && self.iv_stamina.is_some()
    }
}

/// Classifies incoming sightings and routes them into either a queue
/// insertion or a match-based removal, consulting the priority lists,
/// rarity census, and geofence resolver along the way.
pub struct WebhookFilter {
    queue: Arc<PriorityQueue>,
    census: Arc<RarityCensus>,
    geofence: Arc<GeofenceResolver>,
    config: Arc<Config>,
}

impl WebhookFilter {
    pub fn new(
        queue: Arc<PriorityQueue>,
        census: Arc<RarityCensus>,
        geofence: Arc<GeofenceResolver>,
        config: Arc<Config>,
    ) -> Self {
        WebhookFilter { queue, census, geofence, config }
    }

    /// Resolves the area for a coordinate per the active `filter_with_koji`
    /// setting: `None` (drop) when geofencing is on and the point matches no
    /// polygon, otherwise the literal `"GLOBAL"`.
    fn resolve_area(&self, lat: f64, lon: f64) -> Option<String> {
        if self.config.static_cfg.filter_with_koji {
            self.geofence.resolve(lat, lon)
        } else {
            Some(crate::rarity::GLOBAL_AREA.to_string())
        }
    }

    /// Entry point for the scout-feed webhook: routes on `has_iv`.
    pub async fn scout_feed(&self, sighting: Sighting) {
        if sighting.has_iv() {
            self.handle_match(sighting).await;
        } else {
            self.handle_enqueue(sighting).await;
        }
    }

    /// Entry point for the census-feed webhook.
    pub async fn census_feed(&self, sighting: Sighting) {
        let Some(despawn_at) = sighting.despawn_at else { return };
        if despawn_at <= now_secs() {
            return;
        }
        let Some(area) = self.resolve_area(sighting.lat, sighting.lon) else { return };

        self.census
            .add_spawn(
                sighting.species_id,
                sighting.form,
                &area,
                despawn_at,
                self.config.static_cfg.filter_with_koji,
            )
            .await;
    }

    async fn handle_enqueue(&self, sighting: Sighting) {
        let Some(queue_seen_type) = sighting.seen_type.to_queue_type() else { return };
        let reloadable = self.config.reloadable.load();

        let mut area: Option<String> = None;
        let mut s2_cell_id: Option<String> = None;
        let priority;
        let list_type;

        match queue_seen_type {
            QueueSeenType::NearbyCell => {
                match reloadable.cell_list.position(sighting.species_id, sighting.form) {
                    Some(pos) => {
                        priority = pos as i64;
                        list_type = ListType::CellList;
                        s2_cell_id = Some(s2grid::cell_token(sighting.lat, sighting.lon));
                    }
                    None => return,
                }
            }
            QueueSeenType::Wild | QueueSeenType::NearbyStop => {
                if let Some(pos) = reloadable.priority_list.position(sighting.species_id, sighting.form) {
                    priority = pos as i64;
                    list_type = ListType::PriorityList;
                } else if self.config.static_cfg.rarity_enabled {
                    if self.census.state() == CensusState::Calibrating {
                        return;
                    }
                    let Some(resolved) = self.resolve_area(sighting.lat, sighting.lon) else { return };
                    let rank = self
                        .census
                        .rarity_rank(
                            sighting.species_id,
                            sighting.form,
                            &resolved,
                            self.config.static_cfg.filter_with_koji,
                        )
                        .await;
                    area = Some(resolved);

                    match rank {
                        None => {
                            priority = 1000;
                            list_type = ListType::AutoRarity;
                        }
                        Some(r) if (r as usize) <= reloadable.iv_threshold => {
                            priority = 1000 + r;
                            list_type = ListType::AutoRarity;
                        }
                        Some(_) => return,
                    }
                } else {
                    return;
                }
            }
        }

        if area.is_none() {
            area = self.resolve_area(sighting.lat, sighting.lon);
            if area.is_none() {
                return;
            }
        }

        let despawn_at = sighting.despawn_at.unwrap_or_else(|| now_secs() + DEFAULT_DESPAWN_SECS);

        let entry = QueueEntry {
            priority,
            sequence: 0,
            species_id: sighting.species_id,
            form: sighting.form,
            area: area.expect("resolved above"),
            lat: sighting.lat,
            lon: sighting.lon,
            spawnpoint_id: sighting.spawnpoint_id,
            encounter_id: sighting.encounter_id,
            despawn_at,
            seen_type: queue_seen_type,
            s2_cell_id,
            list_type,
            is_scouting: false,
            was_scouted: false,
            scout_started_at: None,
        };

        if self.queue.add(entry).await.is_err() {
            tracing::debug!("duplicate sighting key, already queued");
        }
    }

    async fn handle_match(&self, sighting: Sighting) {
        let reloadable = self.config.reloadable.load();
        let in_any_list = reloadable.priority_list.position(sighting.species_id, sighting.form).is_some()
            || reloadable.cell_list.position(sighting.species_id, sighting.form).is_some();
        if !in_any_list && !self.config.static_cfg.rarity_enabled {
            return;
        }

        if self.resolve_area(sighting.lat, sighting.lon).is_none() {
            return;
        }

        let encounter_id = sighting.encounter_id.as_deref().filter(|id| !id.is_empty());
        let removed = self.queue.remove_by_match(encounter_id, sighting.lat, sighting.lon).await;
        let removed = match removed {
            Some(entry) => Some(entry),
            None => {
                let token = s2grid::cell_token(sighting.lat, sighting.lon);
                self.queue.remove_by_cell_match(sighting.species_id, sighting.form, &token).await
            }
        };

        if let Some(entry) = removed {
            if entry.is_scouting || entry.was_scouted {
                self.queue.record_match(&entry).await;
            } else {
                self.queue.record_early_iv(&entry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ScoutAuth, StaticConfig, TunablesFile};
    use arc_swap::ArcSwap;

    fn test_config(tunables: TunablesFile, rarity_enabled: bool, filter_with_koji: bool) -> Arc<Config> {
        let static_cfg = StaticConfig {
            listen_addr: "0.0.0.0:0".parse().unwrap(),
            scout_base_url: String::new(),
            scout_username: String::new(),
            scout_auth: ScoutAuth::default(),
            geofence_base_url: None,
            geofence_project: None,
            geofence_bearer_token: None,
            filter_with_koji,
            rarity_enabled,
            allowed_ips: Vec::new(),
            header_auth: None,
            general_http_timeout_secs: 20,
            geofence_http_timeout_secs: 15,
        };
        Arc::new(Config {
            static_cfg,
            reloadable: ArcSwap::from_pointee(crate::config::ReloadableConfig::from(&tunables)),
            file_path: std::path::PathBuf::from("/dev/null"),
        })
    }

    fn sighting(species_id: i64, lat: f64, lon: f64, seen_type: &str) -> Sighting {
        Sighting {
            species_id,
            form: None,
            lat,
            lon,
            spawnpoint_id: None,
            encounter_id: Some(format!("enc-{species_id}")),
            despawn_at: Some(now_secs() + 300),
            seen_type: SightingSeenType::parse(seen_type),
            iv_attack: None,
            iv_defense: None,
            iv_stamina: None,
        }
    }

    /// IV arrives after the entry has actually been dispatched for a scout:
    /// per §4.4 step 4 / §8's "Enqueue-then-match" property, this is counted
    /// as `matched`, not `early_iv`.
    #[tokio::test]
    async fn priority_list_wild_capture_and_match() {
        let tunables = TunablesFile { priority_list: vec!["25".into()], ..TunablesFile::default() };
        let config = test_config(tunables, false, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        filter.scout_feed(sighting(25, 1.0, 2.0, "wild")).await;
        let stats = queue.stats().await;
        assert_eq!(stats.queue_size, 1);

        let lease = queue.next_for_scout().await.unwrap();
        queue.mark_scout_complete(lease, true).await;

        let mut iv_sighting = sighting(25, 1.0, 2.0, "wild");
        iv_sighting.iv_attack = Some(15);
        iv_sighting.iv_defense = Some(15);
        iv_sighting.iv_stamina = Some(15);
        filter.scout_feed(iv_sighting).await;

        let stats = queue.stats().await;
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.total_matches.wild, 1);
    }

    /// IV arrives before any scout was ever dispatched: per §4.4 step 4 /
    /// §8's "Early-IV" property, this is counted as `early_iv`, not `matched`.
    #[tokio::test]
    async fn priority_list_wild_early_iv_before_dispatch() {
        let tunables = TunablesFile { priority_list: vec!["25".into()], ..TunablesFile::default() };
        let config = test_config(tunables, false, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        filter.scout_feed(sighting(25, 1.0, 2.0, "wild")).await;
        let stats = queue.stats().await;
        assert_eq!(stats.queue_size, 1);

        let mut iv_sighting = sighting(25, 1.0, 2.0, "wild");
        iv_sighting.iv_attack = Some(15);
        iv_sighting.iv_defense = Some(15);
        iv_sighting.iv_stamina = Some(15);
        filter.scout_feed(iv_sighting).await;

        let stats = queue.stats().await;
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.total_early_iv.wild, 1);
        assert_eq!(stats.total_matches.wild, 0);
    }

    #[tokio::test]
    async fn non_listed_species_dropped_when_rarity_disabled() {
        let config = test_config(TunablesFile::default(), false, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        filter.scout_feed(sighting(1, 1.0, 2.0, "wild")).await;
        assert_eq!(queue.stats().await.queue_size, 0);
    }

    #[tokio::test]
    async fn rarity_path_suppressed_during_calibration() {
        let tunables = TunablesFile { calibration_minutes: 5, ..TunablesFile::default() };
        let config = test_config(tunables, true, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(300));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        filter.scout_feed(sighting(10, 1.0, 2.0, "wild")).await;
        assert_eq!(queue.stats().await.queue_size, 0);
    }

    #[tokio::test]
    async fn rarity_path_accepts_after_calibration() {
        let config = test_config(TunablesFile::default(), true, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        census.add_spawn(10, None, "GLOBAL", now_secs() + 600, false).await;
        census.recalculate().await;

        filter.scout_feed(sighting(10, 1.0, 2.0, "wild")).await;
        let stats = queue.stats().await;
        assert_eq!(stats.queue_size, 1);
        let preview = queue.preview(1).await;
        assert_eq!(preview[0].priority, 1001);
    }

    #[tokio::test]
    async fn cell_list_entry_carries_s2_token() {
        let tunables = TunablesFile { cell_list: vec!["132".into()], ..TunablesFile::default() };
        let config = test_config(tunables, false, false);
        let queue = Arc::new(PriorityQueue::new(5));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census, geofence, config);

        filter.scout_feed(sighting(132, 40.0, -120.0, "nearby_cell")).await;
        let preview = queue.preview(1).await;
        assert_eq!(preview.len(), 1);
        assert!(preview[0].s2_cell_id.is_some());
        assert_eq!(preview[0].list_type, ListType::CellList);
    }

    #[tokio::test]
    async fn priority_list_entry_dispatches_before_rarity_entry_regardless_of_order() {
        let tunables = TunablesFile { priority_list: vec!["25".into()], ..TunablesFile::default() };
        let config = test_config(tunables, true, false);
        let queue = Arc::new(PriorityQueue::new(1));
        let census = Arc::new(RarityCensus::new(0));
        let geofence = Arc::new(GeofenceResolver::new(None, None, None, std::time::Duration::from_secs(1)));
        let filter = WebhookFilter::new(queue.clone(), census.clone(), geofence, config);

        // Rarity-tier species enqueued first, priority-list species second —
        // dispatch order must still favour the priority-list entry.
        census.add_spawn(10, None, "GLOBAL", now_secs() + 600, false).await;
        census.recalculate().await;
        filter.scout_feed(sighting(10, 1.0, 2.0, "wild")).await;
        filter.scout_feed(sighting(25, 3.0, 4.0, "wild")).await;

        let first = queue.next_for_scout().await.unwrap();
        assert_eq!(first.entry.species_id, 25);
        queue.mark_scout_complete(first, true).await;

        let second = queue.next_for_scout().await.unwrap();
        assert_eq!(second.entry.species_id, 10);
    }
}
