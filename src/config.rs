//! Startup configuration, resolved from the environment (§6).

use std::time::Duration;

/// Per-tier token bucket allowance, in tokens per minute.
#[derive(Debug, Clone, Copy)]
pub struct TierCapacities {
    pub standard: u32,
    pub premium: u32,
    pub enterprise: u32,
}

impl Default for TierCapacities {
    fn default() -> Self {
        Self {
            standard: 2,
            premium: 7,
            enterprise: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: String,
    pub tier_capacities: TierCapacities,
    pub top_k_limit: usize,
    pub max_batch_size: usize,
    pub processing_timeout: Duration,
    pub round_cadence: Duration,
    pub num_gpus: u32,
    pub autothrottle_reduction: f64,
    pub min_best_effort_k: u32,
    pub worker_count: usize,
    pub legacy_batch_size: usize,
    pub legacy_batch_wait: Duration,
    pub metrics_port: u16,
}

impl Config {
    /// `autothrottle_threshold = 150 * num_gpus` (§4.D).
    pub fn autothrottle_threshold(&self) -> u64 {
        150 * self.num_gpus as u64
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let store_url = std::env::var("STORE_URL")
            .unwrap_or_else(|_| "memory://local".to_string());

        let tier_capacities = TierCapacities {
            standard: env_u32("TIER_STANDARD_CAPACITY", 2),
            premium: env_u32("TIER_PREMIUM_CAPACITY", 7),
            enterprise: env_u32("TIER_ENTERPRISE_CAPACITY", 32),
        };

        let top_k_limit = env_u32("TOP_K_LIMIT", 50) as usize;
        let max_batch_size = env_u32("MAX_BATCH_SIZE", 10) as usize;
        let processing_timeout = Duration::from_secs(env_u32("PROCESSING_TIMEOUT_SECS", 30) as u64);
        let round_cadence = Duration::from_secs(env_u32("ROUND_CADENCE_SECS", 30) as u64);
        let num_gpus = env_u32("NUM_GPUS", 1);
        let autothrottle_reduction = env_f64("AUTOTHROTTLE_REDUCTION", 0.40);
        let min_best_effort_k = env_u32("MIN_BEST_EFFORT_K", 5);
        let worker_count = env_u32("WORKER_COUNT", 4) as usize;
        let legacy_batch_size = env_u32("LEGACY_BATCH_SIZE", 5) as usize;
        let legacy_batch_wait = Duration::from_secs(env_u32("LEGACY_BATCH_WAIT_SECS", 10) as u64);
        let metrics_port = env_u32("METRICS_PORT", 9100) as u16;

        Ok(Self {
            store_url,
            tier_capacities,
            top_k_limit,
            max_batch_size,
            processing_timeout,
            round_cadence,
            num_gpus,
            autothrottle_reduction,
            min_best_effort_k,
            worker_count,
            legacy_batch_size,
            legacy_batch_wait,
            metrics_port,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "memory://local".to_string(),
            tier_capacities: TierCapacities::default(),
            top_k_limit: 50,
            max_batch_size: 10,
            processing_timeout: Duration::from_secs(30),
            round_cadence: Duration::from_secs(30),
            num_gpus: 1,
            autothrottle_reduction: 0.40,
            min_best_effort_k: 5,
            worker_count: 4,
            legacy_batch_size: 5,
            legacy_batch_wait: Duration::from_secs(10),
            metrics_port: 9100,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
