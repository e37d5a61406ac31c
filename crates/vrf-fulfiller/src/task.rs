// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Result as AnyhowRes;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::CodedError;

#[derive(Error, Debug)]
pub enum SupervisorErr<E: CodedError> {
    /// Restart / replace the task after failure
    #[error("Recoverable error: {0}")]
    Recover(E),
    /// Hard failure and exit the task set
    #[error("Hard failure: {0}")]
    Fault(E),
}

pub type RetryRes<E> = Pin<Box<dyn Future<Output = Result<(), SupervisorErr<E>>> + Send + 'static>>;

pub trait RetryTask {
    type Error: CodedError + Send + Sync + 'static;

    /// Defines how to spawn a task to be monitored for restarts
    ///
    /// The task is expected to return `Ok(())` once `cancel_token` is cancelled.
    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error>;
}

/// Configuration for retry behavior in the supervisor
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay between retry attempts
    pub delay: std::time::Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_multiplier: f64,
    /// Maximum delay between retries, regardless of backoff
    pub max_delay: std::time::Duration,
    /// Maximum number of consecutive retries before giving up (None for unlimited)
    pub max_retries: Option<usize>,
    /// Duration after which to reset the retry counter if a task runs successfully
    pub reset_after: Option<std::time::Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: std::time::Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: std::time::Duration::from_secs(60),
            max_retries: None,
            // Reset the backoff after 5 minutes of running without a failure.
            reset_after: Some(std::time::Duration::from_secs(60 * 5)),
        }
    }
}

impl RetryPolicy {
    pub const CRITICAL_SERVICE: RetryPolicy = RetryPolicy {
        delay: std::time::Duration::from_millis(100),
        backoff_multiplier: 1.5,
        max_delay: std::time::Duration::from_secs(2),
        max_retries: None,
        reset_after: Some(std::time::Duration::from_secs(60)),
    };
}

/// Supervisor for managing and monitoring tasks with retry capabilities
pub struct Supervisor<T: RetryTask> {
    /// The task to be supervised
    task: Arc<T>,
    /// Configuration for retry behavior
    retry_policy: RetryPolicy,
    cancel_token: CancellationToken,
}

impl<T> Supervisor<T>
where
    T: RetryTask + Send + Sync + 'static,
{
    /// Create a new supervisor with a single task
    pub fn new(task: Arc<T>, cancel_token: CancellationToken) -> Self {
        Self { task, retry_policy: RetryPolicy::default(), cancel_token }
    }

    /// Configure the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Calculate the delay for a specific retry attempt
    fn calculate_retry_delay(&self, retry_count: usize) -> std::time::Duration {
        if retry_count == 0 {
            return self.retry_policy.delay;
        }

        let backoff = self.retry_policy.delay.as_millis() as f64
            * self.retry_policy.backoff_multiplier.powi(retry_count as i32);

        let backoff_ms = backoff.min(self.retry_policy.max_delay.as_millis() as f64) as u64;

        std::time::Duration::from_millis(backoff_ms)
    }

    /// Run the supervisor, monitoring tasks and handling retries
    pub async fn spawn(self) -> AnyhowRes<()> {
        let mut tasks = JoinSet::new();
        let mut retry_count = 0;
        let mut last_spawn_time = std::time::Instant::now();

        tracing::debug!("Spawning task");
        tasks.spawn(self.task.spawn(self.cancel_token.clone()));

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(task_res) => match task_res {
                    Ok(_) => {
                        tracing::debug!("Task exited cleanly");
                        if let Some(reset_duration) = self.retry_policy.reset_after {
                            let task_duration = last_spawn_time.elapsed();
                            if task_duration >= reset_duration && retry_count > 0 {
                                tracing::info!(
                                    "Task ran successfully for {:?}, resetting retry counter from {}",
                                    task_duration,
                                    retry_count
                                );
                                retry_count = 0;
                            }
                        }
                    }
                    Err(err) => match err {
                        SupervisorErr::Recover(err) => {
                            if self.cancel_token.is_cancelled() {
                                tracing::debug!("Task failed during shutdown, not restarting: {err:?}");
                                continue;
                            }

                            if let Some(max) = self.retry_policy.max_retries {
                                if retry_count >= max {
                                    tracing::error!("Exceeded maximum retries ({max}) for task");
                                    anyhow::bail!("Exceeded maximum retries for task");
                                }
                            }

                            let delay = self.calculate_retry_delay(retry_count);

                            tracing::warn!(
                                "Recoverable failure detected: {err:?}, spawning replacement (retry {}/{})",
                                retry_count + 1,
                                self.retry_policy.max_retries.map_or("inf".to_string(), |m| m.to_string())
                            );
                            tracing::debug!("Waiting {:?} before retry", delay);

                            let t = self.task.spawn(self.cancel_token.clone());
                            tasks.spawn(async move {
                                tokio::time::sleep(delay).await;
                                t.await
                            });

                            retry_count += 1;
                            last_spawn_time = std::time::Instant::now() + delay;
                        }
                        SupervisorErr::Fault(err) => {
                            tracing::error!("FAULT: Hard failure detected: {err:?}");
                            anyhow::bail!("Hard failure in supervisor task: {}", err.code());
                        }
                    },
                },
                Err(err) => {
                    if err.is_cancelled() {
                        tracing::warn!("Task was canceled, treating it like a clean exit");
                    } else {
                        tracing::error!("ABORT: supervisor join failed");
                        anyhow::bail!(err);
                    }
                }
            }
        }

        Ok(())
    }
}
