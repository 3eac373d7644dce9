//! Queues (§4.E): five named FIFO queues connecting the Scheduler, Worker
//! Pool and the (out-of-scope) notification collaborators.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::DispatchError;
use crate::models::{CompletionRecord, DigestRecord, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    DeepProcessingEmergency,
    DeepProcessingEnterprise,
    DeepProcessingPremium,
    DeepProcessingStandard,
    SchedulerCompletions,
    DigestQueue,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::DeepProcessingEmergency => "deep_processing_emergency",
            QueueName::DeepProcessingEnterprise => "deep_processing_enterprise",
            QueueName::DeepProcessingPremium => "deep_processing_premium",
            QueueName::DeepProcessingStandard => "deep_processing_standard",
            QueueName::SchedulerCompletions => "scheduler_completions",
            QueueName::DigestQueue => "digest_queue",
        }
    }

    /// Deep-processing queues in fixed poll priority (§4.F): emergency
    /// always absolute, then tier order enterprise > premium > standard.
    pub fn deep_priority_order() -> [QueueName; 4] {
        [
            QueueName::DeepProcessingEmergency,
            QueueName::DeepProcessingEnterprise,
            QueueName::DeepProcessingPremium,
            QueueName::DeepProcessingStandard,
        ]
    }

    pub fn for_tier(tier: Tier) -> QueueName {
        match tier {
            Tier::Enterprise => QueueName::DeepProcessingEnterprise,
            Tier::Premium => QueueName::DeepProcessingPremium,
            Tier::Standard | Tier::LiteOnly => QueueName::DeepProcessingStandard,
        }
    }
}

/// An unbounded mpsc channel per queue, with a depth counter for metrics.
/// Modeled on the teacher's queue-depth-tracking registry: a plain struct
/// per named channel rather than a generic broker.
struct Channel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    depth: std::sync::atomic::AtomicI64,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: std::sync::atomic::AtomicI64::new(0),
        }
    }

    fn push(&self, item: T) {
        let _ = self.tx.send(item);
        self.depth.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => {
                self.depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                Some(item)
            }
            _ => None,
        }
    }

    fn len(&self) -> i64 {
        self.depth.load(std::sync::atomic::Ordering::Relaxed).max(0)
    }
}

/// The dispatch core's five named queues (§4.E).
pub struct Queues {
    deep_emergency: Channel<String>,
    deep_enterprise: Channel<String>,
    deep_premium: Channel<String>,
    deep_standard: Channel<String>,
    completions: Channel<CompletionRecord>,
    digest: Channel<DigestRecord>,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    pub fn new() -> Self {
        Self {
            deep_emergency: Channel::new(),
            deep_enterprise: Channel::new(),
            deep_premium: Channel::new(),
            deep_standard: Channel::new(),
            completions: Channel::new(),
            digest: Channel::new(),
        }
    }

    fn deep_channel(&self, name: QueueName) -> Option<&Channel<String>> {
        match name {
            QueueName::DeepProcessingEmergency => Some(&self.deep_emergency),
            QueueName::DeepProcessingEnterprise => Some(&self.deep_enterprise),
            QueueName::DeepProcessingPremium => Some(&self.deep_premium),
            QueueName::DeepProcessingStandard => Some(&self.deep_standard),
            _ => None,
        }
    }

    /// Push a serialized `QueueMessage` onto the deep queue named by `name`.
    pub fn push_deep(&self, name: QueueName, raw_message: String) -> Result<(), DispatchError> {
        match self.deep_channel(name) {
            Some(ch) => {
                ch.push(raw_message);
                Ok(())
            }
            None => Err(DispatchError::QueueUnavailable {
                queue: name.as_str().to_string(),
                reason: "not a deep-processing queue".to_string(),
            }),
        }
    }

    /// Blocking pop with a per-queue timeout (§4.F: 1s per queue in the
    /// fixed-priority poll).
    pub async fn pop_deep(&self, name: QueueName, timeout: Duration) -> Option<String> {
        self.deep_channel(name)?.pop_timeout(timeout).await
    }

    pub fn push_completion(&self, record: CompletionRecord) {
        self.completions.push(record);
    }

    pub async fn pop_completion(&self, timeout: Duration) -> Option<CompletionRecord> {
        self.completions.pop_timeout(timeout).await
    }

    /// Nothing in this crate's runtime path consumes `digest_queue` (§4.E:
    /// downstream notification collaborators are out of scope) — `pop_digest`
    /// exists for operator tooling and tests that need to inspect a
    /// finished session's findings.
    pub fn push_digest(&self, record: DigestRecord) {
        self.digest.push(record);
    }

    pub async fn pop_digest(&self, timeout: Duration) -> Option<DigestRecord> {
        self.digest.pop_timeout(timeout).await
    }

    pub fn depth(&self, name: QueueName) -> i64 {
        match name {
            QueueName::DeepProcessingEmergency => self.deep_emergency.len(),
            QueueName::DeepProcessingEnterprise => self.deep_enterprise.len(),
            QueueName::DeepProcessingPremium => self.deep_premium.len(),
            QueueName::DeepProcessingStandard => self.deep_standard.len(),
            QueueName::SchedulerCompletions => self.completions.len(),
            QueueName::DigestQueue => self.digest.len(),
        }
    }

    /// Sum of depth across the three rate-limited deep queues, used by the
    /// Scheduler's backpressure sample (§4.D).
    pub fn deep_backlog(&self) -> u64 {
        (self.deep_enterprise.len() + self.deep_premium.len() + self.deep_standard.len()).max(0) as u64
    }

    pub fn log_depths(&self) {
        for name in QueueName::deep_priority_order() {
            let depth = self.depth(name);
            if depth > 0 {
                warn!(queue = name.as_str(), depth, "queue backlog");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_round_trips() {
        let queues = Queues::new();
        queues
            .push_deep(QueueName::DeepProcessingStandard, "payload".to_string())
            .unwrap();
        let got = queues
            .pop_deep(QueueName::DeepProcessingStandard, Duration::from_millis(100))
            .await;
        assert_eq!(got, Some("payload".to_string()));
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queues = Queues::new();
        let got = queues
            .pop_deep(QueueName::DeepProcessingEmergency, Duration::from_millis(10))
            .await;
        assert_eq!(got, None);
    }

    #[test]
    fn tier_maps_to_matching_deep_queue() {
        assert!(matches!(
            QueueName::for_tier(Tier::Enterprise),
            QueueName::DeepProcessingEnterprise
        ));
        assert!(matches!(
            QueueName::for_tier(Tier::LiteOnly),
            QueueName::DeepProcessingStandard
        ));
    }

    #[tokio::test]
    async fn backlog_counts_only_rate_limited_deep_queues() {
        let queues = Queues::new();
        queues
            .push_deep(QueueName::DeepProcessingEmergency, "x".to_string())
            .unwrap();
        queues
            .push_deep(QueueName::DeepProcessingStandard, "y".to_string())
            .unwrap();
        assert_eq!(queues.deep_backlog(), 1);
    }
}
