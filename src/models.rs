use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::classifier::ClassifierConfig;
use crate::core::identity::RateLimitScope;
use crate::core::policy::FailurePolicy;

/// Errors found while validating a loaded configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("rate limit policy for {0} must have a non-zero limit and window")]
    EmptyRatePolicy(RateLimitScope),
    #[error("no rate limit policy configured for {0}")]
    MissingRatePolicy(RateLimitScope),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("rate_limit.grace_seconds must be at least {MIN_GRACE_SECONDS}, got {0}")]
    GraceTooShort(u64),
    #[error("expiry.request_log_retention_seconds ({0}) is shorter than classifier.window_seconds ({1})")]
    LogRetentionTooShort(u64, u64),
    #[error("invalid classifier rules: {0}")]
    Rules(String),
}

/// Smallest grace added to a window's TTL
pub const MIN_GRACE_SECONDS: u64 = 10;

/// Requests allowed per trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Maximum requests within the window
    pub limit: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl WindowPolicy {
    pub fn new(limit: u32, window_seconds: u64) -> Self {
        Self { limit, window_seconds }
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit and window per scope
    pub policies: HashMap<RateLimitScope, WindowPolicy>,
    /// Extra lifetime of a stored window beyond its length, in seconds
    pub grace_seconds: u64,
    /// Path prefixes that bypass the limiter
    pub exempt_paths: Vec<String>,
    /// Behavior when the counter backend fails
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(RateLimitScope::Authenticated, WindowPolicy::new(10, 60));
        policies.insert(RateLimitScope::Anonymous, WindowPolicy::new(5, 60));
        Self {
            policies,
            grace_seconds: 10,
            exempt_paths: vec![
                "/health/".to_string(),
                "/static/".to_string(),
                "/media/".to_string(),
                "/admin/jsi18n/".to_string(),
            ],
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// Block list gate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockListConfig {
    /// Behavior when the block list backend fails
    pub failure_policy: FailurePolicy,
}

/// How callers are identified
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Use the first `X-Forwarded-For` entry as the client address
    pub trust_forwarded_for: bool,
    /// Header carrying the signed-in user's id. Unset by default: only enable
    /// it behind an authentication proxy that strips the header from client
    /// requests, otherwise any caller can mint fresh budgets.
    pub user_header: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_for: true,
            user_header: None,
        }
    }
}

/// Auto-block escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Distinct active reasons needed before an identity is blocked
    pub min_distinct_reasons: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self { min_distinct_reasons: 3 }
    }
}

/// Flag expiry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Flags unseen for longer than this are deactivated
    pub retention_days: i64,
    /// Request log entries older than this are pruned
    pub request_log_retention_seconds: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            request_log_retention_seconds: 7200,
        }
    }
}

impl ExpiryConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn request_log_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.request_log_retention_seconds as i64)
    }
}

/// Periodic job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the binary runs the jobs itself
    pub enabled: bool,
    pub classification_interval_seconds: u64,
    pub escalation_interval_seconds: u64,
    pub expiry_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            classification_interval_seconds: 3600,
            escalation_interval_seconds: 86400,
            expiry_interval_seconds: 86400,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix applied to every key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "guard:".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub redis: RedisConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Operator route configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Shared token required in `x-admin-token` when set
    pub token: Option<String>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { metrics_enabled: true }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub block_list: BlockListConfig,
    pub identity: IdentityConfig,
    pub classifier: ClassifierConfig,
    pub escalation: EscalationConfig,
    pub expiry: ExpiryConfig,
    pub scheduler: SchedulerConfig,
    pub admin: AdminConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Reject configurations the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for scope in [RateLimitScope::Authenticated, RateLimitScope::Anonymous] {
            let policy = self
                .rate_limit
                .policies
                .get(&scope)
                .ok_or(ConfigValidationError::MissingRatePolicy(scope))?;
            if policy.limit == 0 || policy.window_seconds == 0 {
                return Err(ConfigValidationError::EmptyRatePolicy(scope));
            }
        }
        if self.rate_limit.grace_seconds < MIN_GRACE_SECONDS {
            return Err(ConfigValidationError::GraceTooShort(self.rate_limit.grace_seconds));
        }
        if self.classifier.window_seconds == 0 {
            return Err(ConfigValidationError::ZeroValue("classifier.window_seconds"));
        }
        if self.expiry.request_log_retention_seconds < self.classifier.window_seconds {
            return Err(ConfigValidationError::LogRetentionTooShort(
                self.expiry.request_log_retention_seconds,
                self.classifier.window_seconds,
            ));
        }
        if self.escalation.min_distinct_reasons == 0 {
            return Err(ConfigValidationError::ZeroValue("escalation.min_distinct_reasons"));
        }
        if self.expiry.retention_days <= 0 {
            return Err(ConfigValidationError::ZeroValue("expiry.retention_days"));
        }
        self.classifier
            .validate()
            .map_err(|e| ConfigValidationError::Rules(e.to_string()))
    }
}
