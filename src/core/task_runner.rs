//! Bounded fan-out of per-unit model calls.
//!
//! Every unit runs under a shared semaphore, gets a fixed timeout per
//! attempt, and is retried a fixed number of times. A unit that exhausts
//! its attempts produces a failed result instead of aborting the batch.

use futures::{stream::FuturesUnordered, Future, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::Result;

/// Timeout and retry policy applied to each unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub call_timeout: Duration,
    pub pause_after_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            pause_after_unit: Duration::from_millis(200),
        }
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            call_timeout: config.call_timeout(),
            pause_after_unit: config.pause_after_unit(),
        }
    }
}

/// Anything the runner can process; the key identifies the result
pub trait WorkItem: Clone + Send + Sync + 'static {
    fn key(&self) -> String;
}

impl WorkItem for String {
    fn key(&self) -> String {
        self.clone()
    }
}

/// Position of a unit within its batch, for logging
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// 1-indexed
    pub task_number: usize,
    pub total_tasks: usize,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome<R> {
    Completed(R),
    Failed { reason: String, attempts: u32 },
}

/// One result per submitted item, echoing the item back
#[derive(Debug, Clone)]
pub struct WorkResult<T, R> {
    pub key: String,
    pub ordinal: usize,
    pub item: T,
    pub outcome: WorkOutcome<R>,
}

impl<T, R> WorkResult<T, R> {
    pub fn output(&self) -> Option<&R> {
        match &self.outcome {
            WorkOutcome::Completed(output) => Some(output),
            WorkOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, WorkOutcome::Failed { .. })
    }
}

/// Executes units with at most `max_concurrent` handlers in flight
#[derive(Debug, Clone)]
pub struct TaskRunner {
    max_concurrent: usize,
    policy: RetryPolicy,
}

impl TaskRunner {
    pub fn new(max_concurrent: usize, policy: RetryPolicy) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            policy,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_concurrent, RetryPolicy::from(config))
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `handler` over every item. Always returns exactly one result per
    /// item, sorted by ordinal.
    pub async fn run<T, R, F, Fut>(&self, label: &str, items: Vec<T>, handler: F) -> Vec<WorkResult<T, R>>
    where
        T: WorkItem,
        R: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let total = items.len();
        let sem = Arc::new(Semaphore::new(self.max_concurrent));
        let handler = Arc::new(handler);
        let mut tasks = FuturesUnordered::new();

        info!("{}: {} units, up to {} concurrent", label, total, self.max_concurrent);

        for (idx, item) in items.into_iter().enumerate() {
            let sem = sem.clone();
            let handler = handler.clone();
            let policy = self.policy;
            let max_concurrent = self.max_concurrent;
            let task_number = idx + 1;

            tasks.push(async move {
                let key = item.key();
                let _permit = match sem.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return WorkResult {
                            key,
                            ordinal: task_number,
                            item,
                            outcome: WorkOutcome::Failed {
                                reason: "Semaphore closed".to_string(),
                                attempts: 0,
                            },
                        };
                    }
                };

                let active = max_concurrent - sem.available_permits();
                info!("🚀 [{}/{}] started: {} (in flight: {})", task_number, total, key, active);

                let outcome = run_with_retry(&policy, &key, task_number, total, &item, handler.as_ref()).await;

                let active = max_concurrent - sem.available_permits();
                match &outcome {
                    WorkOutcome::Completed(_) => {
                        info!("✅ [{}/{}] finished: {} (in flight: {})", task_number, total, key, active)
                    }
                    WorkOutcome::Failed { reason, attempts } => warn!(
                        "❌ [{}/{}] gave up on {} after {} attempts: {}",
                        task_number, total, key, attempts, reason
                    ),
                }

                if !policy.pause_after_unit.is_zero() {
                    tokio::time::sleep(policy.pause_after_unit).await;
                }

                WorkResult {
                    key,
                    ordinal: task_number,
                    item,
                    outcome,
                }
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = tasks.next().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.ordinal);

        let failed = results.iter().filter(|r| r.is_failed()).count();
        info!("{}: {} completed, {} failed", label, total - failed, failed);

        results
    }
}

async fn run_with_retry<T, R, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    task_number: usize,
    total: usize,
    item: &T,
    handler: &F,
) -> WorkOutcome<R>
where
    T: WorkItem,
    F: Fn(T, TaskContext) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let ctx = TaskContext {
            task_number,
            total_tasks: total,
            attempt,
        };

        match tokio::time::timeout(policy.call_timeout, handler(item.clone(), ctx)).await {
            Ok(Ok(output)) => return WorkOutcome::Completed(output),
            Ok(Err(e)) => {
                last_error = e.to_string();
                debug!("{} attempt {}/{} failed: {}", key, attempt, max_attempts, last_error);
            }
            Err(_) => {
                last_error = format!("timed out after {:?}", policy.call_timeout);
                debug!("{} attempt {}/{} timed out", key, attempt, max_attempts);
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    WorkOutcome::Failed {
        reason: last_error,
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowscribeError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_policy(call_timeout: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            call_timeout,
            pause_after_unit: Duration::ZERO,
        }
    }

    fn items(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("item-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_never_exceeds_max_concurrent() {
        let runner = TaskRunner::new(2, fast_policy(Duration::from_secs(5)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let results = runner
            .run("test", items(5), move |item, _ctx| {
                let active = a.clone();
                let peak = p.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(item.len())
                }
            })
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| !r.is_failed()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_attempts_and_keep_batch_size() {
        let runner = TaskRunner::new(5, fast_policy(Duration::from_millis(10)));
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));

        let c = calls.clone();
        let results = runner
            .run("timeouts", items(5), move |item: String, _ctx| {
                let calls = c.clone();
                async move {
                    *calls.lock().unwrap().entry(item).or_insert(0) += 1;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, FlowscribeError>(())
                }
            })
            .await;

        assert_eq!(results.len(), 5);
        for result in &results {
            assert!(result.output().is_none());
            match &result.outcome {
                WorkOutcome::Failed { attempts, reason } => {
                    assert_eq!(*attempts, 3);
                    assert!(reason.contains("timed out"));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls.values().all(|&n| n == 3));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_item_echoed() {
        let runner = TaskRunner::new(3, fast_policy(Duration::from_secs(1)));

        let results = runner
            .run("isolation", items(4), |item: String, _ctx| async move {
                if item == "item-2" {
                    Err(FlowscribeError::Model("bad response".to_string()))
                } else {
                    Ok(item.to_uppercase())
                }
            })
            .await;

        assert_eq!(results.len(), 4);
        let keys: Vec<&str> = results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["item-1", "item-2", "item-3", "item-4"]);

        let failed = &results[1];
        assert_eq!(failed.item, "item-2");
        assert_eq!(
            failed.outcome,
            WorkOutcome::Failed {
                reason: "Model invocation error: bad response".to_string(),
                attempts: 3
            }
        );
        assert_eq!(results[0].output(), Some(&"ITEM-1".to_string()));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_error() {
        let runner = TaskRunner::new(1, fast_policy(Duration::from_secs(1)));

        let results = runner
            .run("retry", items(1), |_item: String, ctx| async move {
                if ctx.attempt < 3 {
                    Err(FlowscribeError::Model("flaky".to_string()))
                } else {
                    Ok(ctx.attempt)
                }
            })
            .await;

        assert_eq!(results[0].output(), Some(&3));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runner = TaskRunner::new(4, RetryPolicy::default());
        let results = runner
            .run("empty", Vec::<String>::new(), |_item, _ctx| async move { Ok(()) })
            .await;
        assert!(results.is_empty());
    }
}
