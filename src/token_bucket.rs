//! Token Buckets (§4.C): per-tier rate limiting on how many deep-processing
//! sessions a tier may start per minute.

use parking_lot::Mutex;

use crate::config::TierCapacities;
use crate::models::Tier;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: std::time::Instant,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: std::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Seconds until `n` tokens will be available, 0 if already available.
    fn eta_secs(&mut self, n: f64) -> f64 {
        self.refill();
        if self.tokens >= n {
            0.0
        } else if self.refill_rate <= 0.0 {
            f64::INFINITY
        } else {
            (n - self.tokens) / self.refill_rate
        }
    }
}

/// One bucket per rate-limited tier (§4.C: Standard/Premium/Enterprise).
/// Life-safety sessions never call into this — the Scheduler's emergency
/// path bypasses it entirely (§4.D).
pub struct TokenBuckets {
    standard: Mutex<Bucket>,
    premium: Mutex<Bucket>,
    enterprise: Mutex<Bucket>,
    min_best_effort_k: u32,
}

impl TokenBuckets {
    pub fn new(capacities: TierCapacities, min_best_effort_k: u32) -> Self {
        Self {
            standard: Mutex::new(Bucket::new(capacities.standard)),
            premium: Mutex::new(Bucket::new(capacities.premium)),
            enterprise: Mutex::new(Bucket::new(capacities.enterprise)),
            min_best_effort_k,
        }
    }

    fn bucket(&self, tier: Tier) -> Option<&Mutex<Bucket>> {
        match tier {
            Tier::Standard => Some(&self.standard),
            Tier::Premium => Some(&self.premium),
            Tier::Enterprise => Some(&self.enterprise),
            Tier::LiteOnly => None,
        }
    }

    /// Attempt to consume one session's worth of tokens (cost = 1 session,
    /// not 1 per event) for `tier`. `LiteOnly` always succeeds — it never
    /// reaches deep processing, so there's nothing to rate-limit.
    pub fn try_consume(&self, tier: Tier) -> bool {
        match self.bucket(tier) {
            Some(bucket) => bucket.lock().try_consume(1.0),
            None => true,
        }
    }

    pub fn eta_secs(&self, tier: Tier) -> f64 {
        match self.bucket(tier) {
            Some(bucket) => bucket.lock().eta_secs(1.0),
            None => 0.0,
        }
    }

    pub fn tokens_available(&self, tier: Tier) -> f64 {
        match self.bucket(tier) {
            Some(bucket) => {
                let mut b = bucket.lock();
                b.refill();
                b.tokens
            }
            None => f64::INFINITY,
        }
    }

    /// `capacity <- max(min_best_effort_k, floor(capacity*(1-factor)))`,
    /// clamping `tokens <= capacity` (§4.C). A no-op for `LiteOnly`, which
    /// has no bucket.
    pub fn throttle(&self, tier: Tier, factor: f64) {
        if let Some(bucket) = self.bucket(tier) {
            let mut b = bucket.lock();
            let reduced = (b.capacity * (1.0 - factor)).floor();
            b.capacity = reduced.max(self.min_best_effort_k as f64);
            b.tokens = b.tokens.min(b.capacity);
        }
    }

    /// Apply `throttle` to every rate-limited tier (§4.D autothrottle step).
    pub fn throttle_all(&self, factor: f64) {
        for tier in Tier::deep_tiers() {
            self.throttle(tier, factor);
        }
    }

    pub fn capacity(&self, tier: Tier) -> f64 {
        match self.bucket(tier) {
            Some(bucket) => bucket.lock().capacity,
            None => f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_and_blocks_once_capacity_is_exhausted() {
        let buckets = TokenBuckets::new(
            TierCapacities {
                standard: 2,
                premium: 7,
                enterprise: 32,
            },
            5,
        );
        assert!(buckets.try_consume(Tier::Standard));
        assert!(buckets.try_consume(Tier::Standard));
        assert!(!buckets.try_consume(Tier::Standard));
    }

    #[test]
    fn lite_only_never_throttled() {
        let buckets = TokenBuckets::new(TierCapacities::default(), 5);
        for _ in 0..1000 {
            assert!(buckets.try_consume(Tier::LiteOnly));
        }
    }

    #[test]
    fn eta_is_zero_when_tokens_available_and_positive_when_drained() {
        let buckets = TokenBuckets::new(
            TierCapacities {
                standard: 1,
                premium: 7,
                enterprise: 32,
            },
            5,
        );
        assert_eq!(buckets.eta_secs(Tier::Standard), 0.0);
        assert!(buckets.try_consume(Tier::Standard));
        assert!(buckets.eta_secs(Tier::Standard) > 0.0);
    }

    #[test]
    fn throttle_reduces_capacity_but_never_below_the_floor() {
        let buckets = TokenBuckets::new(
            TierCapacities {
                standard: 2,
                premium: 7,
                enterprise: 32,
            },
            5,
        );
        buckets.throttle_all(0.40);
        assert_eq!(buckets.capacity(Tier::Standard), 5.0); // floor(2*0.6)=1, clamped to 5
        assert_eq!(buckets.capacity(Tier::Premium), 5.0); // floor(7*0.6)=4, clamped to 5
        assert_eq!(buckets.capacity(Tier::Enterprise), 19.0); // floor(32*0.6)=19
    }

    #[test]
    fn throttle_clamps_existing_tokens_to_new_capacity() {
        let buckets = TokenBuckets::new(
            TierCapacities {
                standard: 20,
                premium: 7,
                enterprise: 32,
            },
            5,
        );
        buckets.throttle(Tier::Standard, 0.40);
        assert!(buckets.tokens_available(Tier::Standard) <= buckets.capacity(Tier::Standard));
    }
}
