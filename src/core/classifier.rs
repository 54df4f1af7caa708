//! Suspicious-activity classification.
//!
//! A classification pass evaluates an ordered list of declarative rules over
//! the request log for a trailing window and writes one flag per flagged
//! `(identity, reason)` into the flag store. Each rule's writes are committed
//! as it goes; a failing rule aborts the pass but leaves earlier rules'
//! flags in place.

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::core::store::{FlagStore, PathFilter, RequestLogStore, StoreError, TimeRange};
use crate::core::suspicion::{FlagUpdate, SuspicionReason};
use crate::utils::describe_window;

/// Errors that can occur during a classification pass
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("detector {reason} failed: {source}")]
    DetectorFailure {
        reason: SuspicionReason,
        source: StoreError,
    },
    #[error("invalid rule configuration: {0}")]
    InvalidRules(String),
}

/// Aggregation a rule performs over the window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Total requests per identity
    TotalVolume { threshold: u64 },
    /// Requests under any of the prefixes, counted per prefix; the first
    /// qualifying prefix is reported for an identity
    PathPrefixes { prefixes: Vec<String>, threshold: u64 },
    /// Requests to exactly one path
    ExactPath { path: String, threshold: u64 },
}

/// An identity whose count crossed a rule's threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub identity: String,
    pub count: u64,
    pub path: Option<String>,
}

impl Rule {
    pub fn threshold(&self) -> u64 {
        match self {
            Rule::TotalVolume { threshold }
            | Rule::PathPrefixes { threshold, .. }
            | Rule::ExactPath { threshold, .. } => *threshold,
        }
    }

    /// Identities whose count in `range` is strictly above the threshold.
    pub async fn evaluate(
        &self,
        logs: &dyn RequestLogStore,
        range: TimeRange,
    ) -> Result<Vec<RuleMatch>, StoreError> {
        match self {
            Rule::TotalVolume { threshold } => {
                Self::over_threshold(logs, range, PathFilter::Any, *threshold, None).await
            }
            Rule::ExactPath { path, threshold } => {
                Self::over_threshold(logs, range, PathFilter::Exact(path.clone()), *threshold, Some(path)).await
            }
            Rule::PathPrefixes { prefixes, threshold } => {
                let mut seen = HashSet::new();
                let mut matches = Vec::new();
                for prefix in prefixes {
                    let hits = Self::over_threshold(
                        logs,
                        range,
                        PathFilter::Prefix(prefix.clone()),
                        *threshold,
                        Some(prefix),
                    )
                    .await?;
                    for hit in hits {
                        if seen.insert(hit.identity.clone()) {
                            matches.push(hit);
                        }
                    }
                }
                Ok(matches)
            }
        }
    }

    async fn over_threshold(
        logs: &dyn RequestLogStore,
        range: TimeRange,
        filter: PathFilter,
        threshold: u64,
        path: Option<&String>,
    ) -> Result<Vec<RuleMatch>, StoreError> {
        Ok(logs
            .count_by_identity(range, filter)
            .await?
            .into_iter()
            .filter(|c| c.count > threshold)
            .map(|c| RuleMatch {
                identity: c.identity,
                count: c.count,
                path: path.cloned(),
            })
            .collect())
    }
}

/// A rule bound to the reason it flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub reason: SuspicionReason,
    pub rule: Rule,
    /// Skip identities already holding an active flag for any of these reasons.
    #[serde(default)]
    pub excluded_by: Vec<SuspicionReason>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    pub fn new(reason: SuspicionReason, rule: Rule) -> Self {
        Self {
            reason,
            rule,
            excluded_by: Vec::new(),
            enabled: true,
        }
    }

    pub fn excluded_by(mut self, reasons: &[SuspicionReason]) -> Self {
        self.excluded_by = reasons.to_vec();
        self
    }

    /// Human-readable details for a match.
    pub fn describe(&self, hit: &RuleMatch, window: Duration) -> String {
        let window = describe_window(window);
        let threshold = self.rule.threshold();
        match (self.reason, hit.path.as_deref()) {
            (SuspicionReason::HighVolume, _) => format!(
                "IP made {} requests in {} (threshold: {})",
                hit.count, window, threshold
            ),
            (SuspicionReason::SensitivePaths, Some(path)) => format!(
                "IP accessed sensitive path {} {} times in {}",
                path, hit.count, window
            ),
            (SuspicionReason::SensitivePaths, None) => format!(
                "IP accessed sensitive paths {} times in {}",
                hit.count, window
            ),
            (SuspicionReason::FailedLogins, _) => {
                format!("IP made {} login attempts in {}", hit.count, window)
            }
            (SuspicionReason::AdminAccess, _) => {
                format!("IP attempted admin access {} times in {}", hit.count, window)
            }
            (SuspicionReason::BruteForce, _) => format!(
                "IP shows brute force pattern with {} requests in {}",
                hit.count, window
            ),
        }
    }
}

/// Classifier configuration. Rule order is evaluation priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Trailing window scanned by each pass, in seconds
    pub window_seconds: u64,
    pub rules: Vec<RuleSpec>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3600,
            rules: vec![
                RuleSpec::new(SuspicionReason::HighVolume, Rule::TotalVolume { threshold: 100 }),
                RuleSpec::new(
                    SuspicionReason::SensitivePaths,
                    Rule::PathPrefixes {
                        prefixes: vec![
                            "/admin/".to_string(),
                            "/api/login/".to_string(),
                            "/api/dashboard/".to_string(),
                            "/api/profile/".to_string(),
                            "/admin/login/".to_string(),
                        ],
                        threshold: 5,
                    },
                ),
                RuleSpec::new(
                    SuspicionReason::FailedLogins,
                    Rule::ExactPath {
                        path: "/api/login/".to_string(),
                        threshold: 10,
                    },
                ),
                RuleSpec::new(
                    SuspicionReason::AdminAccess,
                    Rule::PathPrefixes {
                        prefixes: vec!["/admin/".to_string()],
                        threshold: 3,
                    },
                ),
                RuleSpec::new(SuspicionReason::BruteForce, Rule::TotalVolume { threshold: 200 })
                    .excluded_by(&[SuspicionReason::HighVolume]),
            ],
        }
    }
}

impl ClassifierConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds as i64)
    }

    /// Check rule ordering and exclusions.
    ///
    /// A rule may only be excluded by reasons that are not evaluated after it.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let mut earlier: HashSet<SuspicionReason> = HashSet::new();
        let configured: HashSet<SuspicionReason> = self.rules.iter().map(|spec| spec.reason).collect();

        for spec in &self.rules {
            if earlier.contains(&spec.reason) {
                return Err(ClassifierError::InvalidRules(format!(
                    "reason {} is configured more than once",
                    spec.reason
                )));
            }
            if let Rule::PathPrefixes { prefixes, .. } = &spec.rule {
                if prefixes.is_empty() {
                    return Err(ClassifierError::InvalidRules(format!(
                        "rule {} has no path prefixes",
                        spec.reason
                    )));
                }
            }
            for excluded in &spec.excluded_by {
                if *excluded == spec.reason {
                    return Err(ClassifierError::InvalidRules(format!(
                        "rule {} cannot exclude itself",
                        spec.reason
                    )));
                }
                if configured.contains(excluded) && !earlier.contains(excluded) {
                    return Err(ClassifierError::InvalidRules(format!(
                        "rule {} is excluded by {}, which is evaluated after it",
                        spec.reason, excluded
                    )));
                }
            }
            earlier.insert(spec.reason);
        }
        Ok(())
    }
}

/// What one rule did during a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectorOutcome {
    /// Identities flagged (new or refreshed)
    pub flagged: usize,
    /// Of those, flags created for the first time
    pub created: usize,
    /// Matches skipped because of an exclusion
    pub excluded: usize,
}

/// Result of a classification pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detectors: BTreeMap<SuspicionReason, DetectorOutcome>,
    pub total: usize,
}

impl ClassificationSummary {
    fn new(range: TimeRange) -> Self {
        Self {
            window_start: range.start,
            window_end: range.end,
            detectors: BTreeMap::new(),
            total: 0,
        }
    }

    fn record(&mut self, reason: SuspicionReason, outcome: DetectorOutcome) {
        self.total += outcome.flagged;
        self.detectors.insert(reason, outcome);
    }

    pub fn flagged(&self, reason: SuspicionReason) -> usize {
        self.detectors.get(&reason).map(|o| o.flagged).unwrap_or(0)
    }
}

/// Runs classification passes over the request log
pub struct Classifier {
    logs: Arc<dyn RequestLogStore>,
    flags: Arc<dyn FlagStore>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(
        logs: Arc<dyn RequestLogStore>,
        flags: Arc<dyn FlagStore>,
        config: ClassifierConfig,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        Ok(Self { logs, flags, config })
    }

    /// Classify the trailing window ending at `window_end`.
    pub async fn run_classification_pass(
        &self,
        window_end: DateTime<Utc>,
    ) -> Result<ClassificationSummary, ClassifierError> {
        let range = TimeRange::trailing(window_end, self.config.window());
        info!(
            "Starting suspicious activity classification for {} to {}",
            range.start, range.end
        );

        let mut summary = ClassificationSummary::new(range);
        for spec in self.config.rules.iter().filter(|spec| spec.enabled) {
            match self.apply(spec, range).await {
                Ok(outcome) => summary.record(spec.reason, outcome),
                Err(source) => {
                    error!("Detector {} failed: {}", spec.reason, source);
                    return Err(ClassifierError::DetectorFailure {
                        reason: spec.reason,
                        source,
                    });
                }
            }
        }

        info!(
            "Suspicious activity classification completed. Flagged {} identities",
            summary.total
        );
        Ok(summary)
    }

    async fn apply(&self, spec: &RuleSpec, range: TimeRange) -> Result<DetectorOutcome, StoreError> {
        info!("Checking for {}...", spec.reason);
        let mut outcome = DetectorOutcome::default();

        for hit in spec.rule.evaluate(self.logs.as_ref(), range).await? {
            if self.is_excluded(spec, &hit.identity).await? {
                outcome.excluded += 1;
                continue;
            }

            let (_, created) = self
                .flags
                .upsert(FlagUpdate {
                    identity: hit.identity.clone(),
                    reason: spec.reason,
                    details: spec.describe(&hit, self.config.window()),
                    occurrence_count: hit.count,
                    seen_at: range.end,
                })
                .await?;

            outcome.flagged += 1;
            if created {
                outcome.created += 1;
            }
            increment_counter!("guard_flags_raised_total", "reason" => spec.reason.as_str());
            warn!(
                "Flagged {} for {}: {} requests",
                hit.identity, spec.reason, hit.count
            );
        }
        Ok(outcome)
    }

    async fn is_excluded(&self, spec: &RuleSpec, identity: &str) -> Result<bool, StoreError> {
        for reason in &spec.excluded_by {
            if self.flags.is_active(identity, *reason).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
