//! Admission and scheduling of pipeline executions.
//!
//! This module provides:
//! - A concurrency limiter shared by queued and streaming requests
//! - A bounded task queue for non-streaming requests
//! - The worker pool draining that queue
//! - The registry of in-flight executions
//! - Process-wide request statistics

pub mod active;
pub mod limiter;
pub mod stats;
pub mod task_queue;
pub mod worker;

pub use active::{ActiveRequestEntry, ActiveRequestGuard, ActiveRequests, Reservation};
pub use limiter::ConcurrencyLimiter;
pub use stats::{StatsRegistry, StatsSnapshot};
pub use task_queue::{Task, TaskQueue, TaskResult};
pub use worker::WorkerPool;
