//! Perimeter Dispatch
//!
//! Event-prioritization and dispatch core for a tiered home-security pipeline.
//! Exposes the Candidate Store, Token Buckets, Scheduler, Queues, Worker Pool
//! and Metrics Sink for use by the daemon binary and by integration tests.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod queues;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod token_bucket;
pub mod worker;

pub use errors::{DispatchError, ErrorKind};
