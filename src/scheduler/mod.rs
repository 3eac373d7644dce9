//! Scheduler (§4.D): periodic rounds that pull top-K candidates per tier
//! out of the Candidate Store, rate-limit them through the Token Buckets,
//! and hand them to the Worker Pool via the deep-processing queues. Also
//! owns life-safety preemption and the operator force-schedule entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::DispatchError;
use crate::models::{EventCandidate, Priority, Session, Tier};
use crate::queues::{QueueName, Queues};
use crate::store::CandidateStore;
use crate::token_bucket::TokenBuckets;

/// Emergency K (§4.D): single-event life-safety sessions always request 12,
/// clamped by `Session::effective_k` to the 1 event actually present.
pub const EMERGENCY_K: usize = 12;
pub const EMERGENCY_DEADLINE_MS: u64 = 2_000;

/// Substrings in a lite explainer that force life-safety treatment even
/// when the device hasn't flipped into an explicit emergency/alarm mode
/// (§4.D).
const LIFE_SAFETY_EXPLAINER_SUBSTRINGS: [&str; 8] = [
    "glassbreak",
    "smoke",
    "co",
    "carbon_monoxide",
    "forced_entry",
    "emergency",
    "alarm",
    "break_in",
];

fn is_life_safety_candidate(c: &EventCandidate) -> bool {
    if c.mode.is_life_safety() {
        return true;
    }
    if let Some(explainer) = c.lite_explainer.as_deref() {
        let lower = explainer.to_lowercase();
        if LIFE_SAFETY_EXPLAINER_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
            return true;
        }
    }
    c.priority == Priority::Critical && c.is_door_location()
}

#[derive(Debug, Default, Clone)]
pub struct RoundStats {
    pub backlog: u64,
    pub throttled: bool,
    pub scheduled_per_tier: HashMap<Tier, usize>,
    pub emergency_scheduled: usize,
    pub rate_limited_tiers: Vec<Tier>,
}

pub struct Scheduler {
    store: Arc<CandidateStore>,
    buckets: Arc<TokenBuckets>,
    queues: Arc<Queues>,
    config: Config,
    in_flight: DashMap<String, chrono::DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<CandidateStore>,
        buckets: Arc<TokenBuckets>,
        queues: Arc<Queues>,
        config: Config,
    ) -> Self {
        Self {
            store,
            buckets,
            queues,
            config,
            in_flight: DashMap::new(),
        }
    }

    fn is_in_flight(&self, event_id: &str) -> bool {
        self.in_flight.contains_key(event_id)
    }

    fn mark_in_flight(&self, event_ids: &[String], ttl: Duration) {
        let expiry = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        for id in event_ids {
            self.in_flight.insert(id.clone(), expiry);
        }
    }

    /// Drop in-flight entries whose session never completed in time, so a
    /// stuck worker doesn't permanently hide an event from future rounds.
    fn sweep_expired_in_flight(&self) {
        let now = Utc::now();
        self.in_flight.retain(|_, expiry| *expiry > now);
    }

    /// Non-blocking drain of `scheduler_completions`, freeing in-flight
    /// slots for events the Worker Pool finished (§4.D/§4.E).
    async fn drain_completions(&self) {
        loop {
            match self.queues.pop_completion(Duration::from_millis(1)).await {
                Some(record) => {
                    self.in_flight.remove(&record.event_id);
                }
                None => break,
            }
        }
    }

    /// One scheduling round (§4.D). Emergency preemption always runs first
    /// and bypasses every bucket; the per-tier top-K pass follows and is
    /// subject to autothrottle and rate limiting.
    pub async fn run_round(&self) -> RoundStats {
        self.drain_completions().await;
        self.sweep_expired_in_flight();

        // in-flight set already accounts for scheduled-but-not-completed work;
        // §4.D's backlog sample is queue depth plus that in-flight count.
        let backlog = self.queues.deep_backlog() + self.in_flight.len() as u64;
        let throttled = backlog > self.config.autothrottle_threshold();
        if throttled {
            self.buckets.throttle_all(self.config.autothrottle_reduction);
        }

        let emergency_scheduled = self.run_emergency_pass();

        let mut scheduled_per_tier = HashMap::new();
        let mut rate_limited_tiers = Vec::new();

        for tier in Tier::deep_tiers() {
            let scheduled = self.run_tier_pass(tier, &mut rate_limited_tiers);
            scheduled_per_tier.insert(tier, scheduled);
        }

        if throttled {
            warn!(backlog, threshold = self.config.autothrottle_threshold(), "scheduler autothrottle engaged");
        }

        RoundStats {
            backlog,
            throttled,
            scheduled_per_tier,
            emergency_scheduled,
            rate_limited_tiers,
        }
    }

    fn run_emergency_pass(&self) -> usize {
        let mut scheduled = 0;
        for tier in Tier::deep_tiers() {
            let candidates = self.store.scan_by_tier(tier, self.config.top_k_limit);
            for candidate in candidates {
                if self.is_in_flight(&candidate.event_id) || !is_life_safety_candidate(&candidate) {
                    continue;
                }
                let event_id = candidate.event_id.clone();
                let home_id = candidate.home_id.clone();
                let session = Session::new(
                    home_id.clone(),
                    vec![event_id.clone()],
                    candidate.tier,
                    EMERGENCY_K,
                    EMERGENCY_DEADLINE_MS,
                    Priority::Critical,
                )
                .with_bypass_reason("life_safety");

                if self.dispatch(QueueName::DeepProcessingEmergency, session, &[event_id.clone()], &home_id, EMERGENCY_DEADLINE_MS) {
                    self.store.remove(&event_id, &home_id);
                    scheduled += 1;
                }
            }
        }
        scheduled
    }

    /// One tier's share of the per-tier pass (§4.D step 3): walk candidates
    /// in descending score, admit each through the tier's bucket one at a
    /// time, and enqueue it as its own single-event session. Stops once
    /// `max_batch_size` sessions have been scheduled for this tier.
    fn run_tier_pass(&self, tier: Tier, rate_limited: &mut Vec<Tier>) -> usize {
        let candidates = self.store.scan_by_tier(tier, self.config.top_k_limit);
        let mut scheduled = 0;
        let mut any_rate_limited = false;
        let deadline_ms = self.config.processing_timeout.as_millis() as u64;

        for candidate in candidates {
            if scheduled >= self.config.max_batch_size {
                break;
            }
            if self.is_in_flight(&candidate.event_id)
                || is_life_safety_candidate(&candidate)
                || !candidate.lite_processed
            {
                continue;
            }
            if !self.buckets.try_consume(tier) {
                any_rate_limited = true;
                continue;
            }

            let event_id = candidate.event_id.clone();
            let home_id = candidate.home_id.clone();
            let session = Session::new(home_id.clone(), vec![event_id.clone()], tier, 1, deadline_ms, Priority::Normal);

            if self.dispatch(QueueName::for_tier(tier), session, &[event_id.clone()], &home_id, deadline_ms) {
                self.store.remove(&event_id, &home_id);
                scheduled += 1;
            }
        }

        if any_rate_limited {
            rate_limited.push(tier);
        }
        scheduled
    }

    fn dispatch(&self, queue: QueueName, session: Session, event_ids: &[String], _home_id: &str, deadline_ms: u64) -> bool {
        match serde_json::to_string(&session) {
            Ok(raw) => match self.queues.push_deep(queue, raw) {
                Ok(()) => {
                    self.mark_in_flight(event_ids, Duration::from_millis(deadline_ms.max(1_000) * 2));
                    info!(queue = queue.as_str(), session_id = %session.session_id, events = event_ids.len(), "dispatched session");
                    true
                }
                Err(err) => {
                    warn!(error = %err, "failed to push session onto queue");
                    false
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to serialize session");
                false
            }
        }
    }

    /// Operator entry point (§4.D): `(event_id, tier)`, a single enqueue
    /// that bypasses rate limits; fails cleanly if the event is absent.
    pub fn force_schedule(&self, event_id: &str, tier: Tier) -> Result<String, DispatchError> {
        let candidate = self.store.get(event_id).ok_or_else(|| {
            DispatchError::BadInput(format!("no schedulable event found for id {event_id}"))
        })?;
        if self.is_in_flight(event_id) {
            return Err(DispatchError::BadInput(format!(
                "event {event_id} is already in flight"
            )));
        }

        let home_id = candidate.home_id.clone();
        let deadline_ms = self.config.processing_timeout.as_millis() as u64;
        let session = Session::new(
            home_id.clone(),
            vec![event_id.to_string()],
            tier,
            1,
            deadline_ms,
            Priority::High,
        )
        .with_bypass_reason("operator_forced");
        let session_id = session.session_id.clone();

        if self.dispatch(QueueName::for_tier(tier), session, &[event_id.to_string()], &home_id, deadline_ms) {
            self.store.remove(event_id, &home_id);
            Ok(session_id)
        } else {
            Err(DispatchError::QueueUnavailable {
                queue: QueueName::for_tier(tier).as_str().to_string(),
                reason: "force-schedule dispatch failed".to_string(),
            })
        }
    }
}
