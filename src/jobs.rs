//! Async job polling.

use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::backend::{json_str, BackendClient, CommandOutcome, Method, QUERY_ASYNC_JOB_RESULT};
use crate::config::JobsConfig;
use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::metrics::JOBS_TOTAL;

const STATUS_SUCCEEDED: i64 = 1;
const STATUS_FAILED: i64 = 2;

/// Lower bound on the poll interval; a zero interval would never accumulate
/// elapsed time.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polls `queryAsyncJobResult` until a job reaches a terminal state.
///
/// Elapsed time is the sum of the poll intervals slept so far, so a timeout
/// of `t` allows `ceil(t / interval)` polls regardless of backend latency.
#[derive(Debug, Clone, Copy)]
pub struct JobWaiter {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for JobWaiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}

impl JobWaiter {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            timeout,
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for `job_id` and return its `jobresult` (or `{}` when the backend
    /// sends none).
    ///
    /// Dropping the returned future stops polling.
    pub async fn wait(
        &self,
        client: &BackendClient,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<Value, GatewayError> {
        let mut elapsed = Duration::ZERO;

        while elapsed < self.timeout {
            let body = client
                .execute(ctx, QUERY_ASYNC_JOB_RESULT, &[("jobid", job_id)], Method::Get)
                .await?;
            let job = &body["queryasyncjobresultresponse"];
            let status = job_status(job, "jobstatus");

            match status {
                STATUS_SUCCEEDED => {
                    info!("Job {} completed after {:?}", job_id, elapsed);
                    metrics::counter!(JOBS_TOTAL, "outcome" => "succeeded").increment(1);
                    return Ok(match job.get("jobresult") {
                        Some(result) if !result.is_null() => result.clone(),
                        _ => json!({}),
                    });
                }
                STATUS_FAILED => {
                    let code = json_str(job, "jobresultcode").unwrap_or_else(|| "0".to_string());
                    let detail = json_str(&job["jobresult"], "errortext");
                    error!(
                        "Job {} failed with code {}: {}",
                        job_id,
                        code,
                        detail.as_deref().unwrap_or("no detail")
                    );
                    metrics::counter!(JOBS_TOTAL, "outcome" => "failed").increment(1);
                    return Err(GatewayError::JobFailed {
                        job_id: job_id.to_string(),
                        code,
                        detail,
                    });
                }
                _ => {
                    debug!(
                        "Job {} pending (status {}, procstatus {})",
                        job_id,
                        status,
                        job_status(job, "jobprocstatus")
                    );
                }
            }

            tokio::time::sleep(self.poll_interval).await;
            elapsed += self.poll_interval;
        }

        metrics::counter!(JOBS_TOTAL, "outcome" => "timeout").increment(1);
        Err(GatewayError::JobTimeout {
            job_id: job_id.to_string(),
            timeout_secs: self.timeout.as_millis().div_ceil(1000) as u64,
        })
    }

    /// Wait on a job outcome, or pass a completed one through.
    pub async fn resolve(
        &self,
        client: &BackendClient,
        ctx: &RequestContext,
        outcome: CommandOutcome,
    ) -> Result<Value, GatewayError> {
        match outcome {
            CommandOutcome::Completed(value) => Ok(value),
            CommandOutcome::Job(handle) => self.wait(client, ctx, &handle.job_id).await,
        }
    }
}

/// Status fields arrive as numbers or numeric strings depending on the
/// CloudStack version. Anything unreadable counts as pending.
fn job_status(job: &Value, key: &str) -> i64 {
    json_str(job, key)
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0)
}
