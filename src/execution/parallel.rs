//! Fan-out Coordination
//!
//! Runs a group of sub-tasks concurrently behind one join barrier and
//! merges their outputs by task id, never by completion order. Each task
//! may carry a timeout; a task that times out or panics counts as failed
//! under the configured [`FailurePolicy`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// What to do when some sub-tasks fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed sub-task fails the whole step.
    #[default]
    AllOrNothing,
    /// The step succeeds and lists the failed task ids.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutOptions {
    pub policy: FailurePolicy,
    /// Per-task timeout.
    pub timeout: Option<Duration>,
    pub max_concurrency: usize,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            timeout: None,
            max_concurrency: num_cpus::get().max(1),
        }
    }
}

impl FanOutOptions {
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }
}

/// Result of one sub-task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub id: String,
    pub result: Result<Value, String>,
    pub elapsed: Duration,
}

/// Merged outcome of a fan-out, in declared task order.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport {
    pub policy: FailurePolicy,
    pub outcomes: Vec<TaskOutcome>,
}

impl FanOutReport {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.id.as_str())
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn is_success(&self) -> bool {
        match self.policy {
            FailurePolicy::AllOrNothing => self.outcomes.iter().all(|o| o.result.is_ok()),
            FailurePolicy::BestEffort => true,
        }
    }

    /// Merged step output.
    ///
    /// ```json
    /// {"success": true, "data": {"results": {"a": ..., "b": ...},
    ///   "failed": ["c"], "errors": {"c": "timed out after 5s"},
    ///   "completed": 2, "total": 3}}
    /// ```
    ///
    /// Under all-or-nothing with any failure the output is
    /// `{"success": false, "error": ...}` naming the failed tasks.
    pub fn to_value(&self) -> Value {
        let failed = self.failed_ids();
        if !self.is_success() {
            let details: Vec<String> = self
                .outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().err().map(|e| format!("{}: {}", o.id, e)))
                .collect();
            return json!({
                "success": false,
                "error": format!(
                    "{} of {} sub-tasks failed ({})",
                    failed.len(),
                    self.outcomes.len(),
                    details.join("; ")
                ),
            });
        }

        let mut results = Map::new();
        let mut errors = Map::new();
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(value) => {
                    results.insert(outcome.id.clone(), value.clone());
                }
                Err(e) => {
                    errors.insert(outcome.id.clone(), Value::String(e.clone()));
                }
            }
        }
        json!({
            "success": true,
            "data": {
                "results": results,
                "failed": failed,
                "errors": errors,
                "completed": self.completed(),
                "total": self.outcomes.len(),
            },
        })
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `tasks` concurrently (at most `max_concurrency` at a time) and
/// waits for all of them.
///
/// # Example
///
/// ```
/// use flowrunner::execution::parallel::{run_fan_out, FanOutOptions};
/// use serde_json::json;
///
/// # tokio_test_block(async {
/// let tasks = vec![
///     ("a".to_string(), futures::future::ready(Ok(json!(1)))),
///     ("b".to_string(), futures::future::ready(Ok(json!(2)))),
/// ];
/// let report = run_fan_out(tasks, &FanOutOptions::default()).await;
/// assert!(report.is_success());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub async fn run_fan_out<F>(tasks: Vec<(String, F)>, options: &FanOutOptions) -> FanOutReport
where
    F: Future<Output = Result<Value, String>>,
{
    let total = tasks.len();
    debug!(
        "Fanning out {} tasks (max concurrency {}, policy {:?})",
        total, options.max_concurrency, options.policy
    );
    let timeout = options.timeout;

    let mut indexed: Vec<(usize, TaskOutcome)> = stream::iter(tasks.into_iter().enumerate())
        .map(|(index, (id, task))| async move {
            let started = Instant::now();
            let guarded = AssertUnwindSafe(task).catch_unwind();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(joined) => joined,
                    Err(_) => Ok(Err(format!("timed out after {:?}", limit))),
                },
                None => guarded.await,
            };
            let result = result.unwrap_or_else(|panic| Err(format!("panicked: {}", panic_message(panic))));
            if let Err(e) = &result {
                warn!("Sub-task '{}' failed: {}", id, e);
            }
            (
                index,
                TaskOutcome {
                    id,
                    result,
                    elapsed: started.elapsed(),
                },
            )
        })
        .buffer_unordered(options.max_concurrency.max(1))
        .collect()
        .await;

    indexed.sort_by_key(|(index, _)| *index);
    FanOutReport {
        policy: options.policy,
        outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    fn task(value: Value, delay_ms: u64) -> BoxFuture<'static, Result<Value, String>> {
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok::<Value, String>(value)
        }
        .boxed()
    }

    fn failing(message: &'static str) -> BoxFuture<'static, Result<Value, String>> {
        async move { Err::<Value, String>(message.to_string()) }.boxed()
    }

    #[tokio::test]
    async fn test_merge_by_declared_order() {
        let tasks = vec![
            ("slow".to_string(), task(json!("s"), 50)),
            ("fast".to_string(), task(json!("f"), 1)),
        ];
        let report = run_fan_out(tasks, &FanOutOptions::default()).await;

        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast"]);
        assert_eq!(
            report.to_value()["data"]["results"],
            json!({"slow": "s", "fast": "f"})
        );
    }

    #[tokio::test]
    async fn test_all_or_nothing_fails() {
        let tasks = vec![
            ("a".to_string(), task(json!(1), 0)),
            ("b".to_string(), failing("boom")),
        ];
        let report = run_fan_out(tasks, &FanOutOptions::default()).await;
        assert!(!report.is_success());

        let value = report.to_value();
        assert_eq!(value["success"], json!(false));
        assert!(value["error"].as_str().unwrap().contains("b: boom"));
    }

    #[tokio::test]
    async fn test_best_effort_lists_failures() {
        let tasks = vec![
            ("a".to_string(), task(json!(1), 0)),
            ("b".to_string(), failing("boom")),
            ("c".to_string(), task(json!(3), 0)),
        ];
        let options = FanOutOptions::default().with_policy(FailurePolicy::BestEffort);
        let report = run_fan_out(tasks, &options).await;
        assert!(report.is_success());

        let value = report.to_value();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["data"]["failed"], json!(["b"]));
        assert_eq!(value["data"]["completed"], json!(2));
        assert_eq!(value["data"]["errors"]["b"], json!("boom"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let tasks = vec![
            ("quick".to_string(), task(json!(1), 0)),
            ("stuck".to_string(), task(json!(2), 5_000)),
        ];
        let options = FanOutOptions::default()
            .with_policy(FailurePolicy::BestEffort)
            .with_timeout(Duration::from_millis(50));
        let report = run_fan_out(tasks, &options).await;

        assert_eq!(report.failed_ids(), vec!["stuck"]);
        assert!(report.outcomes[1].result.as_ref().unwrap_err().contains("timed out"));
    }

    fn panicking() -> BoxFuture<'static, Result<Value, String>> {
        async {
            if Value::Null.is_null() {
                panic!("kaboom");
            }
            Ok::<Value, String>(Value::Null)
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let tasks = vec![("ok".to_string(), task(json!(1), 0)), ("bad".to_string(), panicking())];
        let options = FanOutOptions::default().with_policy(FailurePolicy::BestEffort);
        let report = run_fan_out(tasks, &options).await;

        assert_eq!(report.failed_ids(), vec!["bad"]);
        assert!(report.outcomes[1].result.as_ref().unwrap_err().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_concurrency_limit_of_one_still_completes() {
        let tasks = vec![
            ("a".to_string(), task(json!(1), 5)),
            ("b".to_string(), task(json!(2), 5)),
            ("c".to_string(), task(json!(3), 5)),
        ];
        let options = FanOutOptions::default().with_max_concurrency(1);
        let report = run_fan_out(tasks, &options).await;
        assert_eq!(report.completed(), 3);
    }

    #[tokio::test]
    async fn test_empty_fan_out_succeeds() {
        let tasks: Vec<(String, BoxFuture<'static, Result<Value, String>>)> = Vec::new();
        let report = run_fan_out(tasks, &FanOutOptions::default()).await;
        assert!(report.is_success());
        assert_eq!(report.to_value()["data"]["total"], json!(0));
    }
}
