//! Periodic jobs: classification, escalation and flag expiry.

use chrono::Duration as ChronoDuration;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::core::classifier::{ClassificationSummary, Classifier, ClassifierError};
use crate::core::clock::Clock;
use crate::core::escalator::{EscalationSummary, Escalator};
use crate::core::expiry::{ExpirySummary, ExpirySweeper};
use crate::core::store::StoreError;
use crate::models::SchedulerConfig;

/// Errors that can occur while running a job
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Classification(#[from] ClassifierError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// A job that can be triggered on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Task {
    /// Classification pass
    Monitor,
    /// Flag expiry sweep
    Cleanup,
    /// Escalation
    AutoBlock,
    /// Classification, then escalation, then expiry
    All,
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitor" => Ok(Task::Monitor),
            "cleanup" => Ok(Task::Cleanup),
            "auto-block" => Ok(Task::AutoBlock),
            "all" => Ok(Task::All),
            other => Err(format!("unknown task: {}", other)),
        }
    }
}

/// Summaries of the jobs a task ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<ExpirySummary>,
}

pub struct Jobs {
    classifier: Classifier,
    escalator: Escalator,
    sweeper: ExpirySweeper,
    clock: Arc<dyn Clock>,
    retention: ChronoDuration,
}

impl Jobs {
    pub fn new(
        classifier: Classifier,
        escalator: Escalator,
        sweeper: ExpirySweeper,
        clock: Arc<dyn Clock>,
        retention: ChronoDuration,
    ) -> Self {
        Self {
            classifier,
            escalator,
            sweeper,
            clock,
            retention,
        }
    }

    pub async fn classify(&self) -> Result<ClassificationSummary, ClassifierError> {
        self.classifier.run_classification_pass(self.clock.now()).await
    }

    pub async fn escalate(&self) -> Result<EscalationSummary, StoreError> {
        self.escalator.run_escalation().await
    }

    pub async fn expire(&self) -> Result<ExpirySummary, StoreError> {
        self.sweeper.run_expiry_sweep(self.retention).await
    }

    /// Run `task` once.
    pub async fn run(&self, task: Task) -> Result<TaskReport, JobError> {
        let mut report = TaskReport::default();
        match task {
            Task::Monitor => report.classification = Some(self.classify().await?),
            Task::Cleanup => report.expiry = Some(self.expire().await?),
            Task::AutoBlock => report.escalation = Some(self.escalate().await?),
            Task::All => {
                report.classification = Some(self.classify().await?);
                report.escalation = Some(self.escalate().await?);
                report.expiry = Some(self.expire().await?);
            }
        }
        Ok(report)
    }

    /// Spawn the periodic loops. A failing run is logged and retried on the
    /// next tick.
    pub fn start(self: Arc<Self>, config: &SchedulerConfig) -> Vec<JoinHandle<()>> {
        info!("Starting scheduled jobs...");
        vec![
            spawn_every(
                "classification",
                config.classification_interval_seconds,
                self.clone(),
                Task::Monitor,
            ),
            spawn_every(
                "escalation",
                config.escalation_interval_seconds,
                self.clone(),
                Task::AutoBlock,
            ),
            spawn_every("expiry", config.expiry_interval_seconds, self, Task::Cleanup),
        ]
    }
}

fn spawn_every(name: &'static str, seconds: u64, jobs: Arc<Jobs>, task: Task) -> JoinHandle<()> {
    let period = Duration::from_secs(seconds.max(1));
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            match jobs.run(task).await {
                Ok(_) => info!("Scheduled {} job completed", name),
                Err(e) => error!("Scheduled {} job failed: {}", name, e),
            }
        }
    })
}
