use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use search_gateway::config::CorsConfig;
use search_gateway::{logging, routes, AppState, Config, HttpPipeline, WorkerPool};

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let origins = cors.origins.trim();
    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let list: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(list)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    logging::init(&config.logging.level);

    tracing::info!("Starting Search Gateway");

    let pipeline = HttpPipeline::new(&config.pipeline)?;
    tracing::info!("Answer pipeline at {}", config.pipeline.base_url);

    let state = Arc::new(AppState::new(config.clone(), Arc::new(pipeline)));
    let workers = WorkerPool::spawn(state.clone());

    tracing::info!(
        workers = config.scheduler.workers,
        queue_capacity = config.scheduler.queue_capacity,
        max_concurrent = config.scheduler.max_concurrent,
        "Scheduler ready"
    );

    let app = routes::router(state)
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors_layer(&config.cors))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown().await;

    Ok(())
}
