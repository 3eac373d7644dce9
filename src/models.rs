//! Core data model shared by the Candidate Store, Scheduler, Queues and
//! Worker Pool: event candidates, sessions, and the wire schemas used on
//! the tier queues and in persisted session results (§3, §6).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier. Controls rate allowance and which deep queue a
/// session lands on. `LiteOnly` never reaches the deep Scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    LiteOnly,
    Standard,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::LiteOnly => "lite_only",
            Tier::Standard => "standard",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }

    /// 4.A's `(1 + 0.2 * tier_ordinal)` recency multiplier input.
    pub fn ordinal(&self) -> u8 {
        match self {
            Tier::LiteOnly => 0,
            Tier::Standard => 1,
            Tier::Premium => 2,
            Tier::Enterprise => 3,
        }
    }

    /// Tiers actually subject to token-bucket rate limiting and a deep queue.
    pub fn deep_tiers() -> [Tier; 3] {
        [Tier::Standard, Tier::Premium, Tier::Enterprise]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Ordinal used by the Candidate Store priority score (`priority * 100`).
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 1.0,
            Priority::Normal => 2.0,
            Priority::High => 3.0,
            Priority::Critical => 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Stealth,
    Guardian,
    Perimeter,
    Emergency,
    Alarm,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Stealth => "stealth",
            Mode::Guardian => "guardian",
            Mode::Perimeter => "perimeter",
            Mode::Emergency => "emergency",
            Mode::Alarm => "alarm",
        }
    }

    /// Life-safety modes bypass all rate limiting (§4.D).
    pub fn is_life_safety(&self) -> bool {
        matches!(self, Mode::Emergency | Mode::Alarm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Medium,
    High,
}

/// Fixed-key channel map produced by lite triage (§3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    #[serde(default)]
    pub person: bool,
    #[serde(default)]
    pub vehicle: bool,
    #[serde(default)]
    pub pet: bool,
    #[serde(default)]
    pub linger: bool,
}

/// Result of device or server-side lite scoring, attached once triage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteResults {
    pub channels: Channels,
    pub confidence: f64,
    pub explainer: String,
}

/// A pending image event awaiting (or past) scheduling. Lives in the
/// Candidate Store until TTL, eviction, or scheduling removes it (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCandidate {
    pub event_id: String,
    pub home_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,

    pub priority: Priority,
    pub tier: Tier,

    pub image_url: String,
    pub location: String,
    pub mode: Mode,

    pub lite_processed: bool,
    pub channels: Option<Channels>,
    pub lite_confidence: Option<f64>,
    pub lite_explainer: Option<String>,

    pub motion_score: f64,
    pub time_of_day_factor: f64,
    pub location_importance: f64,
}

impl EventCandidate {
    /// TTL from `created_at`; an event past this is logically gone even if
    /// a lazy sweep hasn't removed it from the store yet (§3, §8).
    pub const TTL: chrono::Duration = chrono::Duration::hours(24);

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) >= Self::TTL
    }

    /// Age in whole minutes, used by the recency bonus in the priority score.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        now.signed_duration_since(self.created_at).num_milliseconds() as f64 / 60_000.0
    }

    /// True if the event is door-located, used by life-safety detection.
    pub fn is_door_location(&self) -> bool {
        self.location.to_lowercase().contains("door")
    }
}

/// Deterministic fallback used when ingest omits `home_id` (§6, §9 Open
/// Question: treated as a fallback, not the canonical mapping).
pub fn derive_home_id(user_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    format!("home_{:016x}", hasher.finish())
}

/// The unit of work handed to a worker (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub home_id: String,
    pub event_ids: Vec<String>,
    pub tier: Tier,
    pub k: usize,
    pub deadline_ms: u64,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub bypass_reason: Option<String>,
    pub lite_results: Option<LiteResults>,
}

impl Session {
    pub fn new(
        home_id: impl Into<String>,
        event_ids: Vec<String>,
        tier: Tier,
        k: usize,
        deadline_ms: u64,
        priority: Priority,
    ) -> Self {
        Self {
            session_id: format!("sess_{}", uuid::Uuid::new_v4()),
            home_id: home_id.into(),
            event_ids,
            tier,
            k,
            deadline_ms,
            priority,
            enqueued_at: Utc::now(),
            bypass_reason: None,
            lite_results: None,
        }
    }

    pub fn with_bypass_reason(mut self, reason: impl Into<String>) -> Self {
        self.bypass_reason = Some(reason.into());
        self
    }

    /// `min(K, |event_ids|)`: benign even when K exceeds the event count
    /// (§9, the emergency `K=12` / single-event case).
    pub fn effective_k(&self) -> usize {
        self.k.min(self.event_ids.len())
    }
}

/// Legacy single-event descriptor, kept for backward compatibility and
/// marked deprecated (§9 Open Question). Shares the completion/result
/// contract with `Session` but is processed per-event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyJob {
    pub event_id: String,
    pub home_id: String,
    pub tier: Tier,
    pub deadline_ms: u64,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub bypass_reason: Option<String>,
    pub lite_results: Option<LiteResults>,
}

/// Either a session descriptor or a legacy per-event job, as found on a
/// tier queue (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueMessage {
    Session(Session),
    Legacy(LegacyJob),
}

impl QueueMessage {
    /// Ordered trial of the two schemas: session first, legacy fallback.
    /// Failing both is `BadInput` (§9).
    pub fn parse(raw: &str) -> Result<Self, crate::errors::DispatchError> {
        serde_json::from_str::<Session>(raw)
            .map(QueueMessage::Session)
            .or_else(|_| serde_json::from_str::<LegacyJob>(raw).map(QueueMessage::Legacy))
            .map_err(|e| crate::errors::DispatchError::BadInput(e.to_string()))
    }
}

/// One processed event's findings within a session result (§4.F, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFinding {
    pub event_id: String,
    pub success: bool,
    pub detections: Vec<Detection>,
    pub confidence: f64,
    pub risk_score: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub event_id: String,
    pub class: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_events: usize,
    pub deadline_ms: u64,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Findings {
    pub events_processed: Vec<EventFinding>,
    pub summary: String,
    pub risk_score: f64,
    pub threat_indicators: Vec<ThreatIndicator>,
    pub processing_stats: ProcessingStats,
}

/// Persisted under `session_result:{id}` with a 24h TTL (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    pub success: bool,
    pub processing_duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub findings: Findings,
    pub error_message: Option<String>,
}

impl SessionResult {
    pub const TTL: chrono::Duration = chrono::Duration::hours(24);
}

/// One record per constituent `event_id`, pushed to `scheduler_completions`
/// so the scheduler can free in-flight state (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub event_id: String,
    pub worker_id: String,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

/// One record per finished session, pushed to `digest_queue` for the
/// (out-of-scope) notification collaborators to consume (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestRecord {
    pub session_id: String,
    pub home_id: String,
    pub tier: Tier,
    pub findings: Findings,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_id_is_deterministic() {
        assert_eq!(derive_home_id("user-42"), derive_home_id("user-42"));
        assert_ne!(derive_home_id("user-42"), derive_home_id("user-43"));
    }

    #[test]
    fn effective_k_clamps_to_event_count() {
        let session = Session::new(
            "home_1",
            vec!["ev_1".to_string()],
            Tier::Enterprise,
            12,
            2000,
            Priority::Critical,
        );
        assert_eq!(session.effective_k(), 1);
    }

    #[test]
    fn queue_message_parses_session_then_legacy() {
        let session = Session::new(
            "home_1",
            vec!["ev_1".to_string()],
            Tier::Standard,
            1,
            5000,
            Priority::Normal,
        );
        let raw = serde_json::to_string(&session).unwrap();
        assert!(matches!(
            QueueMessage::parse(&raw).unwrap(),
            QueueMessage::Session(_)
        ));

        let legacy = LegacyJob {
            event_id: "ev_2".to_string(),
            home_id: "home_1".to_string(),
            tier: Tier::Standard,
            deadline_ms: 5000,
            priority: Priority::Normal,
            enqueued_at: Utc::now(),
            bypass_reason: None,
            lite_results: None,
        };
        let raw = serde_json::to_string(&legacy).unwrap();
        assert!(matches!(
            QueueMessage::parse(&raw).unwrap(),
            QueueMessage::Legacy(_)
        ));

        assert!(QueueMessage::parse("not json").is_err());
    }
}
