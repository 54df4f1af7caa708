//! API endpoints for the IP guard service.
//!
//! This module provides the HTTP surface: the request gate middleware, health
//! and metrics endpoints, a read-only rate limit check and the operator
//! routes under `/api/v1/admin`.

pub mod admin;
pub mod guard;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::warn;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::block_list::BlockListGate;
use crate::core::clock::Clock;
use crate::core::identity::{parse_identity, RateLimitKey};
use crate::core::rate_limiter::RateLimiter;
use crate::core::scheduler::Jobs;
use crate::core::store::{FlagStore, RequestLogStore};
use crate::models::{AdminConfig, IdentityConfig};

pub use guard::request_guard;

pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub gate: Arc<BlockListGate>,
    pub request_log: Arc<dyn RequestLogStore>,
    pub flags: Arc<dyn FlagStore>,
    pub jobs: Arc<Jobs>,
    pub clock: Arc<dyn Clock>,
    pub identity: IdentityConfig,
    pub admin: AdminConfig,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health/").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(render_metrics)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/rate-limit").route(web::post().to(check_rate_limit)))
                .service(web::scope("/admin").configure(admin::config)),
        );
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Rate limit check request
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitRequest {
    pub ip: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Rate limit check response
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitResponse {
    pub allowed: bool,
    pub scope: String,
    pub used: usize,
    pub limit: Option<u32>,
    pub message: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus exposition endpoint
async fn render_metrics(state: web::Data<AppState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().json(ErrorResponse::new("metrics are disabled")),
    }
}

/// Rate limit check endpoint
///
/// Reports where the given caller stands in its window without charging it.
/// Guarded by the admin token when one is configured.
pub async fn check_rate_limit(
    http: HttpRequest,
    state: web::Data<AppState>,
    req: web::Json<RateLimitRequest>,
) -> impl Responder {
    if let Err(resp) = admin::authorize(&http, &state) {
        return resp;
    }
    let ip = match parse_identity(&req.ip) {
        Ok(ip) => ip,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())),
    };
    let key = match req.user_id.as_deref().filter(|user| !user.is_empty()) {
        Some(user_id) => RateLimitKey::authenticated(user_id, ip),
        None => RateLimitKey::anonymous(ip),
    };
    let Some(policy) = state.rate_limiter.policy_for(key.scope) else {
        return HttpResponse::Ok().json(RateLimitResponse {
            allowed: true,
            scope: key.scope.to_string(),
            used: 0,
            limit: None,
            message: "No rate limit configured".to_string(),
        });
    };

    match state.rate_limiter.current_usage(&key, policy).await {
        Ok(used) => {
            let allowed = used < policy.limit as usize;
            HttpResponse::Ok().json(RateLimitResponse {
                allowed,
                scope: key.scope.to_string(),
                used,
                limit: Some(policy.limit),
                message: if allowed {
                    "Request would be allowed".to_string()
                } else {
                    "Rate limit exceeded".to_string()
                },
            })
        }
        Err(e) => {
            warn!("Error reading rate limit usage for key {}: {}", key, e);
            HttpResponse::ServiceUnavailable().json(ErrorResponse::new("Rate limit backend unavailable"))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::classifier::{Classifier, ClassifierConfig};
    use crate::core::clock::ManualClock;
    use crate::core::escalator::Escalator;
    use crate::core::expiry::ExpirySweeper;
    use crate::core::memory::{MemoryBlockList, MemoryCounterStore, MemoryFlagStore, MemoryRequestLog};
    use crate::core::policy::FailurePolicy;
    use crate::core::store::{BlockList, IdentityCount, PathFilter, TimeRange};
    use crate::models::{EscalationConfig, RateLimitConfig};
    use chrono::{Duration, TimeZone, Utc};

    pub struct TestStores {
        pub clock: ManualClock,
        pub counters: Arc<MemoryCounterStore>,
        pub log: Arc<MemoryRequestLog>,
        pub flags: Arc<MemoryFlagStore>,
        pub blocks: Arc<MemoryBlockList>,
    }

    impl TestStores {
        pub fn new() -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
            Self {
                counters: Arc::new(MemoryCounterStore::new(Arc::new(clock.clone()))),
                clock,
                log: Arc::new(MemoryRequestLog::new()),
                flags: Arc::new(MemoryFlagStore::new()),
                blocks: Arc::new(MemoryBlockList::new()),
            }
        }

        pub async fn count_all(&self) -> Vec<IdentityCount> {
            let range = TimeRange::trailing(self.clock.now(), Duration::days(1));
            self.log.count_by_identity(range, PathFilter::Any).await.unwrap()
        }

        pub fn state_with_blocks(&self, blocks: Arc<dyn BlockList>, policy: FailurePolicy) -> web::Data<AppState> {
            self.build(blocks, policy, IdentityConfig::default(), AdminConfig::default())
        }

        pub fn build(
            &self,
            blocks: Arc<dyn BlockList>,
            policy: FailurePolicy,
            identity: IdentityConfig,
            admin: AdminConfig,
        ) -> web::Data<AppState> {
            let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
            let jobs = Jobs::new(
                Classifier::new(self.log.clone(), self.flags.clone(), ClassifierConfig::default())
                    .expect("default rules are valid"),
                Escalator::new(self.flags.clone(), blocks.clone(), clock.clone(), EscalationConfig::default()),
                ExpirySweeper::new(self.flags.clone(), self.log.clone(), clock.clone(), Duration::hours(2)),
                clock.clone(),
                Duration::days(7),
            );
            web::Data::new(AppState {
                rate_limiter: Arc::new(RateLimiter::new(
                    self.counters.clone(),
                    clock.clone(),
                    RateLimitConfig::default(),
                )),
                gate: Arc::new(BlockListGate::new(blocks, clock.clone(), policy)),
                request_log: self.log.clone(),
                flags: self.flags.clone(),
                jobs: Arc::new(jobs),
                clock,
                identity,
                admin,
                metrics: None,
            })
        }
    }

    pub fn state_with(stores: &TestStores) -> web::Data<AppState> {
        stores.build(
            stores.blocks.clone(),
            FailurePolicy::Open,
            IdentityConfig::default(),
            AdminConfig::default(),
        )
    }
}
