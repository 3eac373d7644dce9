//! Operator CLI for the Scheduler's force-schedule entry point (§4.D).
//! Talks to a running `perimeterd`'s admin HTTP surface; it has no
//! in-process access to the Scheduler itself.

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(about = "Force-schedule specific events, bypassing buckets and top-K selection")]
struct Args {
    /// Base URL of the running daemon's admin surface.
    #[arg(long, env = "PERIMETERD_ADMIN_URL", default_value = "http://127.0.0.1:8080")]
    admin_url: String,

    /// Event id to force-schedule now.
    #[arg(long)]
    event_id: String,

    /// Tier to enqueue the event under.
    #[arg(long, value_enum)]
    tier: Tier,
}

#[derive(Debug, Clone, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum Tier {
    Standard,
    Premium,
    Enterprise,
}

#[derive(Debug, Serialize)]
struct ForceScheduleRequest {
    event_id: String,
    tier: Tier,
}

#[derive(Debug, Deserialize)]
struct ForceScheduleResponse {
    session_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/admin/force-schedule", args.admin_url))
        .json(&ForceScheduleRequest {
            event_id: args.event_id,
            tier: args.tier,
        })
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("force-schedule request failed ({status}): {body}");
    }

    let parsed: ForceScheduleResponse = response.json().await?;
    println!("scheduled session {}", parsed.session_id);
    Ok(())
}
