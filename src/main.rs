//! IP guard service
//!
//! This is the main entry point for the IP guard service.
//! It initializes the storage backends and components, starts the periodic
//! jobs and runs the web server.

use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use ip_guard_service::api::{self, request_guard, AppState};
use ip_guard_service::config;
use ip_guard_service::core::memory::{MemoryBlockList, MemoryCounterStore, MemoryFlagStore, MemoryRequestLog};
use ip_guard_service::core::store::{BlockList, CounterStore, FlagStore, RequestLogStore};
use ip_guard_service::core::{
    BlockListGate, Classifier, Clock, Escalator, ExpirySweeper, Jobs, RateLimiter, RedisStore, SystemClock,
};
use ip_guard_service::models::{Config, StorageBackend};

struct Backends {
    counters: Arc<dyn CounterStore>,
    request_log: Arc<dyn RequestLogStore>,
    flags: Arc<dyn FlagStore>,
    blocks: Arc<dyn BlockList>,
}

async fn build_backends(config: &Config, clock: Arc<dyn Clock>) -> Result<Backends> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            Ok(Backends {
                counters: Arc::new(MemoryCounterStore::new(clock)),
                request_log: Arc::new(MemoryRequestLog::new()),
                flags: Arc::new(MemoryFlagStore::new()),
                blocks: Arc::new(MemoryBlockList::new()),
            })
        }
        StorageBackend::Redis => {
            let store = Arc::new(
                RedisStore::from_config(&config.storage.redis).context("Failed to create Redis client")?,
            );
            // Startup continues when Redis is down; the failure policies decide.
            match store.ping().await {
                Ok(()) => info!("Connected to Redis at {}", config.storage.redis.url),
                Err(e) => warn!("Redis at {} is unreachable: {}", config.storage.redis.url, e),
            }
            Ok(Backends {
                counters: store.clone(),
                request_log: store.clone(),
                flags: store.clone(),
                blocks: store,
            })
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting IP guard service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let metrics = if config.monitoring.metrics_enabled {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?,
        )
    } else {
        None
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let backends = build_backends(&config, clock.clone()).await?;

    let rate_limiter = Arc::new(RateLimiter::new(
        backends.counters.clone(),
        clock.clone(),
        config.rate_limit.clone(),
    ));
    let gate = Arc::new(BlockListGate::new(
        backends.blocks.clone(),
        clock.clone(),
        config.block_list.failure_policy,
    ));
    let jobs = Arc::new(Jobs::new(
        Classifier::new(
            backends.request_log.clone(),
            backends.flags.clone(),
            config.classifier.clone(),
        )?,
        Escalator::new(
            backends.flags.clone(),
            backends.blocks.clone(),
            clock.clone(),
            config.escalation.clone(),
        ),
        ExpirySweeper::new(
            backends.flags.clone(),
            backends.request_log.clone(),
            clock.clone(),
            config.expiry.request_log_retention(),
        ),
        clock.clone(),
        config.expiry.retention(),
    ));

    if config.scheduler.enabled {
        jobs.clone().start(&config.scheduler);
    } else {
        info!("Scheduled jobs are disabled");
    }

    // Create API state
    let state = web::Data::new(AppState {
        rate_limiter,
        gate,
        request_log: backends.request_log,
        flags: backends.flags,
        jobs,
        clock,
        identity: config.identity.clone(),
        admin: config.admin.clone(),
        metrics,
    });

    info!(
        "Listening on {}:{}",
        config.server.host, config.server.port
    );

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(from_fn(request_guard))
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
