//! Perimeter Dispatch daemon.
//!
//! Wires the Candidate Store, Token Buckets, Scheduler and Worker Pool
//! together, starts the scheduling round loop and the worker pool, and
//! serves a minimal HTTP surface for health and metrics. The ingest API
//! that populates the Candidate Store is out of scope (§1 Non-goals) —
//! this binary assumes something else is calling `CandidateStore::add`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perimeter_dispatch::config::Config;
use perimeter_dispatch::metrics;
use perimeter_dispatch::queues::Queues;
use perimeter_dispatch::scheduler::Scheduler;
use perimeter_dispatch::store::CandidateStore;
use perimeter_dispatch::token_bucket::TokenBuckets;
use perimeter_dispatch::worker::{StubInferenceCollaborator, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(round_cadence = ?config.round_cadence, worker_count = config.worker_count, "starting perimeter-dispatch");

    let store = Arc::new(CandidateStore::new());
    let buckets = Arc::new(TokenBuckets::new(config.tier_capacities, config.min_best_effort_k));
    let queues = Arc::new(Queues::new());
    let scheduler = Arc::new(Scheduler::new(store.clone(), buckets.clone(), queues.clone(), config.clone()));
    let worker_pool = Arc::new(WorkerPool::new(
        queues.clone(),
        config.clone(),
        Arc::new(StubInferenceCollaborator),
    ));

    if let Err(err) = metrics::install(config.metrics_port) {
        warn!(error = %err, "metrics exporter failed to start; continuing without it");
    }

    for worker_id in 0..config.worker_count {
        let pool = worker_pool.clone();
        tokio::spawn(async move {
            pool.run(&format!("worker_{worker_id}")).await;
        });
    }

    {
        let scheduler = scheduler.clone();
        let cadence = config.round_cadence;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                let stats = scheduler.run_round().await;
                metrics::record_round(&stats);
                info!(
                    backlog = stats.backlog,
                    throttled = stats.throttled,
                    emergency = stats.emergency_scheduled,
                    "scheduler round complete"
                );
            }
        });
    }

    {
        let store = store.clone();
        let buckets = buckets.clone();
        let queues = queues.clone();
        tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                metrics::record_store_size(store.stats().total);
                for tier in perimeter_dispatch::models::Tier::deep_tiers() {
                    metrics::record_tokens_available(tier, buckets.tokens_available(tier));
                }
                for name in [
                    perimeter_dispatch::queues::QueueName::DeepProcessingEmergency,
                    perimeter_dispatch::queues::QueueName::DeepProcessingEnterprise,
                    perimeter_dispatch::queues::QueueName::DeepProcessingPremium,
                    perimeter_dispatch::queues::QueueName::DeepProcessingStandard,
                ] {
                    metrics::record_queue_depth(name.as_str(), queues.depth(name));
                }
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                metrics::record_system_snapshot(&sys);
            }
        });
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/force-schedule", post(force_schedule))
        .with_state(scheduler);

    let listener = TcpListener::bind(("0.0.0.0", 8080)).await?;
    info!("health endpoint listening on :8080");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ForceScheduleRequest {
    event_id: String,
    tier: perimeter_dispatch::models::Tier,
}

#[derive(Debug, Serialize)]
struct ForceScheduleResponse {
    session_id: String,
}

/// Operator entry point (§4.D) exposed over the admin HTTP surface so
/// `force-schedule` (the CLI binary) doesn't need in-process access to the
/// running daemon's Scheduler.
async fn force_schedule(
    State(scheduler): State<Arc<Scheduler>>,
    Json(request): Json<ForceScheduleRequest>,
) -> Result<Json<ForceScheduleResponse>, (axum::http::StatusCode, String)> {
    scheduler
        .force_schedule(&request.event_id, request.tier)
        .map(|session_id| Json(ForceScheduleResponse { session_id }))
        .map_err(|err| (axum::http::StatusCode::BAD_REQUEST, err.to_string()))
}
