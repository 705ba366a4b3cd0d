//! Task state shared by the failover and migration controllers

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Task status
///
/// Moves forward only: Pending -> Doing -> Success | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Enqueued, not yet acted on
    Pending,
    /// Being processed
    Doing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Doing => write!(f, "doing"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which task collection a query reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskQueryType {
    /// Queued, not started
    Pending,
    /// In flight
    Doing,
    /// Resolved, oldest first
    History,
}

impl FromStr for TaskQueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "queue" => Ok(TaskQueryType::Pending),
            "doing" => Ok(TaskQueryType::Doing),
            "history" => Ok(TaskQueryType::History),
            other => Err(Error::InvalidArgument(format!("unknown task type: {}", other))),
        }
    }
}

/// Wall clock in milliseconds, used for task timestamps
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Bounded retry with exponential backoff for transient failures
///
/// Non-transient errors are returned at once. After `attempts` tries the
/// last error is returned.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
