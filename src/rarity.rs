//! Rolling per-area rarity census, used to derive a dynamic priority tier
//! for sightings that are not on a static priority list.
//!
//! Grounded directly on `LazyIVQueue/rarity/manager.py` (`RarityManager`):
//! a per-`(area, species_key)` multiset of despawn timestamps, periodically
//! cleaned and ranked in the background.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const GLOBAL_AREA: &str = "GLOBAL";

/// Collision-prone by design (see spec's Open Questions): the sentinel for
/// "this species is active but hasn't been through a `recalculate()` pass
/// yet" shares the same numeric band as a real `1000 + rank` value for areas
/// whose cache holds more than a few hundred species. Kept as specified
/// rather than moved to a distinct band.
const PENDING_RANK_BASE: usize = 1000;

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn species_key(species_id: i64, form: Option<i64>) -> String {
    match form {
        Some(form) => format!("{species_id}:{form}"),
        None => species_id.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CensusState {
    Calibrating,
    Ready,
}

/// One row of the `/rarity` endpoint's per-area ranking, carrying both the
/// area-local rank and (when known) the species' rank across all areas.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AreaRankingEntry {
    pub species: String,
    pub area_rank: usize,
    pub global_rank: Option<usize>,
    pub would_queue: bool,
}

#[derive(Default)]
struct Inner {
    /// area -> species_key -> despawn timestamps still active.
    actives: HashMap<String, HashMap<String, Vec<u64>>>,
    /// area -> species_key -> 1-based rank (rarest = 1), from the last
    /// `recalculate()` pass.
    rank_cache: HashMap<String, HashMap<String, usize>>,
    /// "area:species_key" -> 1-based global rank across all areas.
    global_rank_cache: HashMap<String, usize>,
    /// area -> (species_key, count) sorted ascending by count (rarest
    /// first), from the last `recalculate()` pass. Backs `top_rarest_by_area`
    /// in `stats()`.
    sorted_counts: HashMap<String, Vec<(String, usize)>>,
    /// Lifetime count of `add_spawn` calls, never decremented by cleanup.
    total_spawns_tracked: u64,
    /// Unix timestamp of the last completed `recalculate()`, if any.
    last_ranking_time: Option<u64>,
}

/// Per-area spawn counts reported by `/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AreaSpawnStats {
    pub unique_pokemon: usize,
    pub active_spawns: usize,
}

/// One row of a `top_rarest_by_area` list.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopRarestEntry {
    pub pokemon: String,
    pub count: usize,
}

/// The reloadable config values echoed back in `/stats`' `rarity.config`
/// block, mirroring the original `RarityManager.get_stats()`'s `"config"` key.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CensusStatsConfig {
    pub calibration_minutes: u64,
    pub iv_threshold: usize,
    pub cell_threshold: usize,
    pub ranking_interval_seconds: u64,
}

/// Full rarity statistics block for `/stats`, spliced in under `"rarity"`
/// when `rarity_enabled`, matching `api/server.py`'s `handle_stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CensusStats {
    pub status: &'static str,
    pub calibration_remaining_seconds: u64,
    pub total_spawns_tracked: u64,
    pub total_active_spawns: usize,
    pub areas_tracked: usize,
    pub last_ranking_time: Option<u64>,
    pub config: CensusStatsConfig,
    pub by_area: HashMap<String, AreaSpawnStats>,
    pub top_rarest_by_area: HashMap<String, Vec<TopRarestEntry>>,
}

/// Tracks active spawns per area and periodically derives rarity ranks.
pub struct RarityCensus {
    inner: Mutex<Inner>,
    started_at: Instant,
    calibration: std::sync::atomic::AtomicU64,
}

impl RarityCensus {
    pub fn new(calibration_secs: u64) -> Self {
        RarityCensus {
            inner: Mutex::new(Inner::default()),
            started_at: Instant::now(),
            calibration: std::sync::atomic::AtomicU64::new(calibration_secs),
        }
    }

    /// Updates the calibration duration on hot reload. Takes effect for the
    /// next `state()` check; does not retroactively reset the start clock.
    pub fn set_calibration_secs(&self, secs: u64) {
        self.calibration.store(secs, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn state(&self) -> CensusState {
        let calibration = self.calibration.load(std::sync::atomic::Ordering::Relaxed);
        if self.started_at.elapsed().as_secs() >= calibration {
            CensusState::Ready
        } else {
            CensusState::Calibrating
        }
    }

    /// Records an active spawn. In global mode (`filter_with_koji=false`)
    /// the caller is expected to already have coerced `area` to `"GLOBAL"`;
    /// this is re-asserted here so the invariant holds regardless of caller.
    pub async fn add_spawn(
        &self,
        species_id: i64,
        form: Option<i64>,
        area: &str,
        despawn_at: u64,
        filter_with_koji: bool,
    ) {
        let area = if filter_with_koji { area } else { GLOBAL_AREA };
        let key = species_key(species_id, form);
        let mut inner = self.inner.lock().await;
        inner.actives.entry(area.to_string()).or_default().entry(key).or_default().push(despawn_at);
        inner.total_spawns_tracked += 1;
    }

    /// Looks up the rarity rank for `(species_id, form)` in `area`, per the
    /// lookup order in spec §4.2: exact form match, then any-form match,
    /// then any cached key for the species under a different form.
    pub async fn rarity_rank(
        &self,
        species_id: i64,
        form: Option<i64>,
        area: &str,
        filter_with_koji: bool,
    ) -> Option<i64> {
        let area = if filter_with_koji { area } else { GLOBAL_AREA };
        let inner = self.inner.lock().await;

        let ranks = inner.rank_cache.get(area);
        let bare = species_id.to_string();
        let exact = form.map(|f| format!("{species_id}:{f}"));

        if let Some(ranks) = ranks {
            if let Some(exact) = &exact {
                if let Some(r) = ranks.get(exact) {
                    return Some(*r as i64);
                }
            }
            if let Some(r) = ranks.get(&bare) {
                return Some(*r as i64);
            }
            let prefix = format!("{species_id}:");
            if let Some((_, r)) = ranks.iter().find(|(k, _)| k.starts_with(&prefix)) {
                return Some(*r as i64);
            }
        }

        // Active but not yet ranked: pending-rank sentinel.
        if let Some(species) = inner.actives.get(area) {
            let is_active = species.contains_key(&bare)
                || exact.as_ref().map_or(false, |k| species.contains_key(k))
                || species.keys().any(|k| k.starts_with(&format!("{species_id}:")));
            if is_active {
                let pending = ranks.map_or(0, |r| r.len()) + PENDING_RANK_BASE;
                return Some(pending as i64);
            }
        }

        None
    }

    /// Drops expired elements, then empty species, then empty areas.
    pub async fn cleanup(&self) {
        let now = now_secs();
        let mut inner = self.inner.lock().await;
        let mut emptied_areas = 0usize;
        inner.actives.retain(|_, species| {
            species.retain(|_, timestamps| {
                timestamps.retain(|t| *t > now);
                !timestamps.is_empty()
            });
            let keep = !species.is_empty();
            if !keep {
                emptied_areas += 1;
            }
            keep
        });
        if emptied_areas > 0 {
            tracing::debug!(emptied_areas, "census cleanup dropped empty areas");
        }
    }

    /// Recomputes per-area and global ranks from the current active
    /// multisets. Ties break by species key, which is deterministic within
    /// one call even though it differs from pure insertion order.
    pub async fn recalculate(&self) {
        let mut inner = self.inner.lock().await;

        let mut rank_cache = HashMap::with_capacity(inner.actives.len());
        let mut sorted_counts = HashMap::with_capacity(inner.actives.len());
        let mut global_counts: Vec<(String, String, usize)> = Vec::new();

        for (area, species) in inner.actives.iter() {
            let mut counts: Vec<(&String, usize)> =
                species.iter().map(|(k, v)| (k, v.len())).collect();
            counts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

            let mut ranks = HashMap::with_capacity(counts.len());
            let mut sorted = Vec::with_capacity(counts.len());
            for (rank, (key, count)) in counts.into_iter().enumerate() {
                ranks.insert(key.clone(), rank + 1);
                sorted.push((key.clone(), count));
                global_counts.push((area.clone(), key.clone(), count));
            }
            rank_cache.insert(area.clone(), ranks);
            sorted_counts.insert(area.clone(), sorted);
        }

        global_counts.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| {
            format!("{}:{}", a.0, a.1).cmp(&format!("{}:{}", b.0, b.1))
        }));
        let mut global_rank_cache = HashMap::with_capacity(global_counts.len());
        for (rank, (area, key, _)) in global_counts.into_iter().enumerate() {
            global_rank_cache.insert(format!("{area}:{key}"), rank + 1);
        }

        let became_ready = self.state() == CensusState::Ready;
        inner.rank_cache = rank_cache;
        inner.global_rank_cache = global_rank_cache;
        inner.sorted_counts = sorted_counts;
        inner.last_ranking_time = Some(now_secs());
        drop(inner);

        if became_ready {
            tracing::debug!("rarity recalculate complete, census is ready");
        } else {
            tracing::debug!("rarity recalculate complete, still calibrating");
        }
    }

    /// Per-area rankings for the `/rarity` endpoint: species keys sorted by
    /// ascending area-local rank (rarest first), capped at `limit`, each
    /// paired with its global rank (if the species has one) and a
    /// `would_queue` flag for whether that global rank clears `iv_threshold`.
    pub async fn area_rankings(&self, area: &str, limit: usize, iv_threshold: usize) -> Vec<AreaRankingEntry> {
        let inner = self.inner.lock().await;
        let Some(ranks) = inner.rank_cache.get(area) else { return Vec::new() };
        let mut entries: Vec<(String, usize)> = ranks.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by_key(|(_, rank)| *rank);
        entries.truncate(limit);
        entries
            .into_iter()
            .map(|(species, area_rank)| {
                let global_rank = inner.global_rank_cache.get(&format!("{area}:{species}")).copied();
                let would_queue = global_rank.map_or(false, |r| r <= iv_threshold);
                AreaRankingEntry { species, area_rank, global_rank, would_queue }
            })
            .collect()
    }

    /// Full rarity statistics block for `/stats`, mirroring the original
    /// `RarityManager.get_stats()`: status, calibration countdown, lifetime
    /// and live spawn counts, and a top-10-rarest list per area.
    pub async fn stats(&self, config: CensusStatsConfig) -> CensusStats {
        let inner = self.inner.lock().await;

        let mut by_area = HashMap::with_capacity(inner.actives.len());
        let mut total_active_spawns = 0usize;
        for (area, species) in inner.actives.iter() {
            let active_spawns: usize = species.values().map(|v| v.len()).sum();
            total_active_spawns += active_spawns;
            by_area.insert(area.clone(), AreaSpawnStats { unique_pokemon: species.len(), active_spawns });
        }

        let mut top_rarest_by_area = HashMap::with_capacity(inner.sorted_counts.len());
        for (area, sorted) in inner.sorted_counts.iter() {
            let top = sorted
                .iter()
                .take(10)
                .map(|(pokemon, count)| TopRarestEntry { pokemon: pokemon.clone(), count: *count })
                .collect();
            top_rarest_by_area.insert(area.clone(), top);
        }

        let (status, calibration_remaining_seconds) = match self.state() {
            CensusState::Calibrating => {
                let remaining = self
                    .calibration
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .saturating_sub(self.started_at.elapsed().as_secs());
                ("calibrating", remaining)
            }
            CensusState::Ready => ("ready", 0),
        };

        CensusStats {
            status,
            calibration_remaining_seconds,
            total_spawns_tracked: inner.total_spawns_tracked,
            total_active_spawns,
            areas_tracked: inner.actives.len(),
            last_ranking_time: inner.last_ranking_time,
            config,
            by_area,
            top_rarest_by_area,
        }
    }

    /// Logs a summary line: spawns tracked, unique species, active areas,
    /// and (while still calibrating) seconds remaining. Mirrors the
    /// original implementation's periodic `log_census_status`.
    pub async fn log_status(&self) {
        let inner = self.inner.lock().await;
        let area_count = inner.actives.len();
        let mut species = std::collections::HashSet::new();
        let mut active_spawns = 0usize;
        for by_species in inner.actives.values() {
            for (key, timestamps) in by_species {
                species.insert(key.clone());
                active_spawns += timestamps.len();
            }
        }
        drop(inner);

        match self.state() {
            CensusState::Calibrating => {
                let remaining = self
                    .calibration
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .saturating_sub(self.started_at.elapsed().as_secs());
                tracing::info!(
                    active_spawns,
                    unique_species = species.len(),
                    area_count,
                    calibration_seconds_remaining = remaining,
                    "rarity census status (calibrating)"
                );
            }
            CensusState::Ready => {
                tracing::info!(active_spawns, unique_species = species.len(), area_count, "rarity census status");
            }
        }
    }

    /// Spawns the cleanup/ranking loops. Both periods are read fresh from
    /// `cleanup_period`/`ranking_period` after every tick rather than fixed
    /// at startup, so a hot-reloaded `cleanup_interval_seconds` /
    /// `ranking_interval_seconds` takes effect without a restart (mirroring
    /// how the janitor re-reads `timeout_iv` every sweep).
    pub fn spawn_background(
        self: std::sync::Arc<Self>,
        cleanup_period: impl Fn() -> std::time::Duration + Send + Sync + 'static,
        ranking_period: impl Fn() -> std::time::Duration + Send + Sync + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_cleanup = tokio::time::Instant::now() + cleanup_period();
            let mut next_ranking = tokio::time::Instant::now() + ranking_period();
            let mut was_ready = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_cleanup) => {
                        self.cleanup().await;
                        next_cleanup = tokio::time::Instant::now() + cleanup_period();
                    }
                    _ = tokio::time::sleep_until(next_ranking) => {
                        self.recalculate().await;
                        self.log_status().await;
                        let ready = self.state() == CensusState::Ready;
                        if ready && !was_ready {
                            tracing::info!("rarity census calibration complete");
                        }
                        was_ready = ready;
                        next_ranking = tokio::time::Instant::now() + ranking_period();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calibrating_until_elapsed() {
        let census = RarityCensus::new(3600);
        assert_eq!(census.state(), CensusState::Calibrating);
    }

    #[tokio::test]
    async fn ready_immediately_with_zero_calibration() {
        let census = RarityCensus::new(0);
        assert_eq!(census.state(), CensusState::Ready);
    }

    #[tokio::test]
    async fn never_seen_species_returns_none() {
        let census = RarityCensus::new(0);
        assert_eq!(census.rarity_rank(999, None, "area", true).await, None);
    }

    #[tokio::test]
    async fn active_unranked_species_returns_pending_sentinel() {
        let census = RarityCensus::new(0);
        census.add_spawn(25, None, "area", now_secs() + 600, true).await;
        let rank = census.rarity_rank(25, None, "area", true).await;
        assert_eq!(rank, Some(1000));
    }

    #[tokio::test]
    async fn recalculate_ranks_rarest_first() {
        let census = RarityCensus::new(0);
        // species 1: three actives, species 2: one active -> 2 is rarer.
        for _ in 0..3 {
            census.add_spawn(1, None, "area", now_secs() + 600, true).await;
        }
        census.add_spawn(2, None, "area", now_secs() + 600, true).await;
        census.recalculate().await;

        assert_eq!(census.rarity_rank(2, None, "area", true).await, Some(1));
        assert_eq!(census.rarity_rank(1, None, "area", true).await, Some(2));
    }

    #[tokio::test]
    async fn global_mode_coerces_area() {
        let census = RarityCensus::new(0);
        census.add_spawn(25, None, "some_real_area", now_secs() + 600, false).await;
        census.recalculate().await;
        assert_eq!(census.rarity_rank(25, None, "ignored", false).await, Some(1));
    }

    #[tokio::test]
    async fn cleanup_drops_expired_entries() {
        let census = RarityCensus::new(0);
        census.add_spawn(25, None, "area", now_secs().saturating_sub(10), true).await;
        census.cleanup().await;
        assert_eq!(census.rarity_rank(25, None, "area", true).await, None);
    }

    #[tokio::test]
    async fn any_form_match_falls_back_to_bare_species() {
        let census = RarityCensus::new(0);
        census.add_spawn(150, None, "area", now_secs() + 600, true).await;
        census.recalculate().await;
        assert_eq!(census.rarity_rank(150, Some(5), "area", true).await, Some(1));
    }

    #[tokio::test]
    async fn area_rankings_carry_global_rank_and_would_queue() {
        let census = RarityCensus::new(0);
        census.add_spawn(2, None, "area", now_secs() + 600, true).await;
        for _ in 0..3 {
            census.add_spawn(1, None, "area", now_secs() + 600, true).await;
        }
        census.recalculate().await;

        let rankings = census.area_rankings("area", 10, 1).await;
        assert_eq!(rankings[0].species, "2");
        assert_eq!(rankings[0].area_rank, 1);
        assert_eq!(rankings[0].global_rank, Some(1));
        assert!(rankings[0].would_queue);

        assert_eq!(rankings[1].species, "1");
        assert_eq!(rankings[1].area_rank, 2);
        assert!(!rankings[1].would_queue);
    }

    fn sample_stats_config() -> CensusStatsConfig {
        CensusStatsConfig {
            calibration_minutes: 0,
            iv_threshold: 1,
            cell_threshold: 1,
            ranking_interval_seconds: 60,
        }
    }

    #[tokio::test]
    async fn stats_reports_calibrating_with_remaining_seconds() {
        let census = RarityCensus::new(3600);
        census.add_spawn(25, None, "area", now_secs() + 600, true).await;

        let stats = census.stats(sample_stats_config()).await;
        assert_eq!(stats.status, "calibrating");
        assert!(stats.calibration_remaining_seconds > 0);
        assert_eq!(stats.total_spawns_tracked, 1);
        assert_eq!(stats.total_active_spawns, 1);
        assert_eq!(stats.areas_tracked, 1);
        assert!(stats.last_ranking_time.is_none());
        assert!(stats.top_rarest_by_area.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_top_rarest_after_recalculate() {
        let census = RarityCensus::new(0);
        census.add_spawn(2, None, "area", now_secs() + 600, true).await;
        for _ in 0..3 {
            census.add_spawn(1, None, "area", now_secs() + 600, true).await;
        }
        census.recalculate().await;

        let stats = census.stats(sample_stats_config()).await;
        assert_eq!(stats.status, "ready");
        assert_eq!(stats.calibration_remaining_seconds, 0);
        assert_eq!(stats.total_spawns_tracked, 4);
        assert!(stats.last_ranking_time.is_some());

        let area_stats = stats.by_area.get("area").unwrap();
        assert_eq!(area_stats.unique_pokemon, 2);
        assert_eq!(area_stats.active_spawns, 4);

        let top = stats.top_rarest_by_area.get("area").unwrap();
        assert_eq!(top[0].pokemon, "2");
        assert_eq!(top[0].count, 1);
        assert_eq!(top[1].pokemon, "1");
        assert_eq!(top[1].count, 3);
    }
}
