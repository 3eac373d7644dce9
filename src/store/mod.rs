//! Candidate Store (§4.B): a per-home priority-ordered index over pending
//! events, backed by a bounded-size, TTL'd in-memory table.
//!
//! Modeled as a single concrete struct rather than a trait — there is one
//! backend here, matching the teacher's preference for concrete
//! `parking_lot`-guarded registries (e.g. its queue depth tracker) over a
//! trait object for a single implementation.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::models::{EventCandidate, Priority, Tier};
use crate::scoring::{priority_score, PriorityScoreInput};

/// Maximum entries retained per home; overflow evicts the lowest-scoring
/// entries together with their event records (§3).
pub const CAP_PER_HOME: usize = 2000;

/// `f64` ordering wrapper that sorts *highest score first* so a `BTreeSet`
/// built from it iterates in descending-score order, with ties broken by
/// the paired `event_id` ascending (§5: "ties broken by event_id
/// lexicographic order").
#[derive(Debug, Clone, PartialEq)]
struct ScoreKey(f64);

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.total_cmp(&self.0)
    }
}

#[derive(Default)]
struct HomeIndex {
    by_score: BTreeSet<(ScoreKey, String)>,
    by_event: HashMap<String, ScoreKey>,
}

impl HomeIndex {
    fn upsert(&mut self, event_id: &str, score: f64) {
        if let Some(old) = self.by_event.remove(event_id) {
            self.by_score.remove(&(old, event_id.to_string()));
        }
        self.by_event
            .insert(event_id.to_string(), ScoreKey(score));
        self.by_score.insert((ScoreKey(score), event_id.to_string()));
    }

    fn remove(&mut self, event_id: &str) {
        if let Some(old) = self.by_event.remove(event_id) {
            self.by_score.remove(&(old, event_id.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.by_event.len()
    }

    /// Lowest-scoring event id, if any (the last element under our
    /// reversed ordering).
    fn lowest(&self) -> Option<String> {
        self.by_score.last().map(|(_, id)| id.clone())
    }

    fn top(&self, k: usize) -> Vec<String> {
        self.by_score.iter().take(k).map(|(_, id)| id.clone()).collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub total: usize,
    pub per_tier: HashMap<Tier, usize>,
    pub per_priority: HashMap<Priority, usize>,
}

pub struct CandidateStore {
    homes: DashMap<String, RwLock<HomeIndex>>,
    records: DashMap<String, EventCandidate>,
    event_home: DashMap<String, String>,
    cap_per_home: usize,
}

impl Default for CandidateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateStore {
    pub fn new() -> Self {
        Self {
            homes: DashMap::new(),
            records: DashMap::new(),
            event_home: DashMap::new(),
            cap_per_home: CAP_PER_HOME,
        }
    }

    #[cfg(test)]
    pub fn with_cap(cap_per_home: usize) -> Self {
        Self {
            cap_per_home,
            ..Self::new()
        }
    }

    fn compute_score(&self, c: &EventCandidate) -> f64 {
        let now = Utc::now();
        priority_score(PriorityScoreInput {
            priority_weight: c.priority.weight(),
            person: c.channels.map(|ch| ch.person).unwrap_or(false),
            vehicle: c.channels.map(|ch| ch.vehicle).unwrap_or(false),
            motion_score: c.motion_score,
            time_of_day_factor: c.time_of_day_factor,
            location_importance: c.location_importance,
            age_minutes: c.age_minutes(now),
            tier_ordinal: c.tier.ordinal(),
        })
    }

    /// Insert or, for an already-known `event_id`, idempotently refresh its
    /// priority score in place (§4.B, §8 idempotence). Returns `false` on
    /// an internal failure; the index is never left with an orphan entry.
    pub fn add(&self, candidate: EventCandidate) -> bool {
        let event_id = candidate.event_id.clone();
        let home_id = candidate.home_id.clone();

        let existed = self.records.contains_key(&event_id);
        let merged = if let Some(mut existing) = self.records.get_mut(&event_id) {
            // Keep the original `created_at` so TTL counts from first sight;
            // take every other field from the fresher payload.
            let created_at = existing.created_at;
            *existing = candidate;
            existing.created_at = created_at;
            existing.clone()
        } else {
            self.records.insert(event_id.clone(), candidate.clone());
            candidate
        };

        self.event_home.insert(event_id.clone(), home_id.clone());
        let score = self.compute_score(&merged);

        let home = self.homes.entry(home_id.clone()).or_default();
        {
            let mut idx = home.write();
            idx.upsert(&event_id, score);
        }

        if !existed {
            self.trim(&home_id);
        }
        true
    }

    fn trim(&self, home_id: &str) {
        let Some(home) = self.homes.get(home_id) else {
            return;
        };
        loop {
            let (len, lowest) = {
                let idx = home.read();
                (idx.len(), idx.lowest())
            };
            if len <= self.cap_per_home {
                break;
            }
            let Some(lowest_id) = lowest else { break };
            {
                let mut idx = home.write();
                idx.remove(&lowest_id);
            }
            self.records.remove(&lowest_id);
            self.event_home.remove(&lowest_id);
            warn!(home_id, event_id = %lowest_id, "candidate store cap exceeded, evicted lowest-scoring event");
            crate::metrics::record_store_eviction(home_id);
        }
    }

    /// Lazily drop an expired record if `event_id` has one, returning
    /// whether the record survives (§3 invariant).
    fn evict_if_expired(&self, event_id: &str) -> bool {
        let expired = self
            .records
            .get(event_id)
            .map(|r| r.is_expired(Utc::now()))
            .unwrap_or(false);
        if expired {
            if let Some((_, home_id)) = self.event_home.remove(event_id) {
                if let Some(home) = self.homes.get(&home_id) {
                    home.write().remove(event_id);
                }
            }
            self.records.remove(event_id);
        }
        !expired
    }

    pub fn get(&self, event_id: &str) -> Option<EventCandidate> {
        if !self.evict_if_expired(event_id) {
            return None;
        }
        self.records.get(event_id).map(|r| r.clone())
    }

    pub fn top(&self, home_id: &str, k: usize) -> Vec<EventCandidate> {
        let Some(home) = self.homes.get(home_id) else {
            return Vec::new();
        };
        let ids = home.read().top(k * 2 + 8); // headroom for lazily-expired entries
        ids.into_iter()
            .filter(|id| self.evict_if_expired(id))
            .filter_map(|id| self.records.get(&id).map(|r| r.clone()))
            .take(k)
            .collect()
    }

    /// Recompute and persist `event_id`'s priority score (§4.B).
    pub fn update_score(&self, event_id: &str, home_id: &str) -> bool {
        if !self.evict_if_expired(event_id) {
            return false;
        }
        let Some(record) = self.records.get(event_id).map(|r| r.clone()) else {
            return false;
        };
        let score = self.compute_score(&record);
        if let Some(home) = self.homes.get(home_id) {
            home.write().upsert(event_id, score);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, event_id: &str, home_id: &str) -> bool {
        let removed_record = self.records.remove(event_id).is_some();
        self.event_home.remove(event_id);
        if let Some(home) = self.homes.get(home_id) {
            home.write().remove(event_id);
        }
        removed_record
    }

    /// Union over homes of their top candidates matching `tier`, globally
    /// re-sorted by score (§4.B: "allowed to be O(H*k)").
    pub fn scan_by_tier(&self, tier: Tier, limit: usize) -> Vec<EventCandidate> {
        let mut pool = Vec::new();
        for entry in self.homes.iter() {
            let home_id = entry.key().clone();
            for candidate in self.top(&home_id, limit) {
                if candidate.tier == tier {
                    pool.push(candidate);
                }
            }
        }
        self.sort_and_truncate(pool, limit)
    }

    pub fn scan_pending(&self, limit: usize) -> Vec<EventCandidate> {
        let mut pool = Vec::new();
        for entry in self.homes.iter() {
            let home_id = entry.key().clone();
            for candidate in self.top(&home_id, limit) {
                if !candidate.lite_processed {
                    pool.push(candidate);
                }
            }
        }
        self.sort_and_truncate(pool, limit)
    }

    fn sort_and_truncate(&self, mut pool: Vec<EventCandidate>, limit: usize) -> Vec<EventCandidate> {
        pool.sort_by(|a, b| {
            let sa = self.compute_score(a);
            let sb = self.compute_score(b);
            sb.total_cmp(&sa).then_with(|| a.event_id.cmp(&b.event_id))
        });
        pool.truncate(limit);
        pool
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.records.iter() {
            stats.total += 1;
            *stats.per_tier.entry(entry.tier).or_insert(0) += 1;
            *stats.per_priority.entry(entry.priority).or_insert(0) += 1;
        }
        stats
    }

    pub fn home_count(&self, home_id: &str) -> usize {
        self.homes
            .get(home_id)
            .map(|h| h.read().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channels, Mode};

    fn candidate(event_id: &str, home_id: &str, priority: Priority) -> EventCandidate {
        EventCandidate {
            event_id: event_id.to_string(),
            home_id: home_id.to_string(),
            user_id: "user_1".to_string(),
            created_at: Utc::now(),
            priority,
            tier: Tier::Standard,
            image_url: "https://example.com/img.jpg".to_string(),
            location: "front_door".to_string(),
            mode: Mode::Guardian,
            lite_processed: false,
            channels: Some(Channels {
                person: true,
                ..Default::default()
            }),
            lite_confidence: None,
            lite_explainer: None,
            motion_score: 0.5,
            time_of_day_factor: 1.0,
            location_importance: 1.0,
        }
    }

    #[test]
    fn idempotent_add_keeps_size_and_updates_score() {
        let store = CandidateStore::new();
        let mut c = candidate("ev_x", "home_1", Priority::Low);
        c.motion_score = 0.1;
        store.add(c.clone());
        let before = store.get("ev_x").unwrap();
        let score_before = store.compute_score(&before);

        c.priority = Priority::Critical;
        c.motion_score = 0.9;
        store.add(c);

        assert_eq!(store.home_count("home_1"), 1);
        let after = store.get("ev_x").unwrap();
        let score_after = store.compute_score(&after);
        assert!(score_after > score_before);
    }

    #[test]
    fn overflow_evicts_lowest_scoring_entry_only() {
        let store = CandidateStore::with_cap(2);
        let mut low = candidate("ev_low", "home_1", Priority::Low);
        low.motion_score = 0.0;
        let mut mid = candidate("ev_mid", "home_1", Priority::Normal);
        mid.motion_score = 0.0;
        let mut high = candidate("ev_high", "home_1", Priority::Critical);
        high.motion_score = 0.0;

        store.add(low);
        store.add(mid);
        assert_eq!(store.home_count("home_1"), 2);

        store.add(high);
        assert_eq!(store.home_count("home_1"), 2);
        assert!(store.get("ev_low").is_none());
        assert!(store.get("ev_mid").is_some());
        assert!(store.get("ev_high").is_some());
    }

    #[test]
    fn top_k_tie_breaks_by_event_id() {
        let store = CandidateStore::new();
        let a = candidate("ev_b", "home_1", Priority::Normal);
        let b = candidate("ev_a", "home_1", Priority::Normal);
        store.add(a);
        store.add(b);

        let top = store.top("home_1", 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].event_id, "ev_a");
    }

    #[test]
    fn remove_deletes_from_index_and_records() {
        let store = CandidateStore::new();
        store.add(candidate("ev_1", "home_1", Priority::Normal));
        assert!(store.remove("ev_1", "home_1"));
        assert!(store.get("ev_1").is_none());
        assert_eq!(store.home_count("home_1"), 0);
    }

    #[test]
    fn scan_by_tier_filters_and_globally_sorts() {
        let store = CandidateStore::new();
        let mut a = candidate("ev_1", "home_1", Priority::Low);
        a.tier = Tier::Premium;
        let mut b = candidate("ev_2", "home_2", Priority::Critical);
        b.tier = Tier::Premium;
        let mut c = candidate("ev_3", "home_1", Priority::Critical);
        c.tier = Tier::Standard;

        store.add(a);
        store.add(b);
        store.add(c);

        let premium = store.scan_by_tier(Tier::Premium, 10);
        assert_eq!(premium.len(), 2);
        assert_eq!(premium[0].event_id, "ev_2");
    }
}
