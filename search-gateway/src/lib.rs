pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod scheduler;
pub mod stream;
pub mod test_util;

pub use config::{ChatEnvelope, Config, SchedulerConfig};
pub use error::{GatewayError, Result};
pub use models::request::{DeliveryMode, SearchPayload, SearchRequest};
pub use pipeline::{HttpPipeline, Invocation, PipelineError, PipelineInvoker};
pub use scheduler::{
    ActiveRequests, ConcurrencyLimiter, StatsRegistry, StatsSnapshot, Task, TaskQueue, WorkerPool,
};
pub use stream::{SseSession, StreamReframer};

use std::sync::Arc;

use scheduler::stats::{Capacity, Gauges};

/// Shared application state.
///
/// Created once at startup and handed to the worker pool, the streaming
/// handlers and the status endpoint.
pub struct AppState {
    pub config: Config,
    /// The answer pipeline.
    pub pipeline: Arc<dyn PipelineInvoker>,
    /// Pending JSON requests.
    pub queue: Arc<TaskQueue>,
    /// Cap on simultaneous pipeline runs, shared by both delivery modes.
    pub limiter: ConcurrencyLimiter,
    /// Executions currently in flight.
    pub active: Arc<ActiveRequests>,
    pub stats: Arc<StatsRegistry>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Arc<dyn PipelineInvoker>) -> Self {
        let scheduler = &config.scheduler;
        Self {
            queue: Arc::new(TaskQueue::new(scheduler.queue_capacity)),
            limiter: ConcurrencyLimiter::new(scheduler.max_concurrent),
            active: Arc::new(ActiveRequests::new()),
            stats: Arc::new(StatsRegistry::new()),
            pipeline,
            config,
        }
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            queue_capacity: self.config.scheduler.queue_capacity,
            max_concurrent: self.config.scheduler.max_concurrent,
            workers: self.config.scheduler.workers,
        }
    }

    /// Current statistics with live queue depth and in-flight count.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.capacity(),
            Gauges {
                queue_depth: self.queue.len(),
                in_flight: self.active.len(),
            },
        )
    }
}
