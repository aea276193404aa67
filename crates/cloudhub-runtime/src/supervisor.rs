//! Supervisor
//!
//! Tracks the hub's long-running tasks (dispatcher, protocol servers):
//! - spawning with per-task health tracking
//! - failure logging, isolated to the failing task
//! - bounded shutdown: wait until a deadline, then abort stragglers

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloudhub_core::HubResult;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Health of a supervised task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskHealthStatus {
    Running,
    Finished,
    Failed(String),
}

/// Owns the join handles of the hub's background tasks
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Vec<(String, JoinHandle<()>)>,
    health: Arc<DashMap<String, TaskHealthStatus>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task whose result is recorded instead of propagated
    pub fn spawn<F, T>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = HubResult<T>> + Send + 'static,
        T: std::fmt::Debug + Send + 'static,
    {
        let name = name.into();
        let health = self.health.clone();
        health.insert(name.clone(), TaskHealthStatus::Running);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let status = match task.await {
                Ok(output) => {
                    debug!("Task {} finished: {:?}", task_name, output);
                    TaskHealthStatus::Finished
                }
                Err(e) => {
                    error!("Task {} failed: {}", task_name, e);
                    TaskHealthStatus::Failed(e.to_string())
                }
            };
            health.insert(task_name, status);
        });

        self.tasks.push((name, handle));
    }

    /// Current status of every task, sorted by name
    pub fn health_summary(&self) -> Vec<(String, TaskHealthStatus)> {
        let mut summary: Vec<_> = self
            .health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        summary.sort_by(|a, b| a.0.cmp(&b.0));
        summary
    }

    /// True while no task has failed
    pub fn is_healthy(&self) -> bool {
        self.health
            .iter()
            .all(|entry| !matches!(entry.value(), TaskHealthStatus::Failed(_)))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task until `timeout` elapses, then abort the rest.
    ///
    /// Callers cancel the tasks first; this only collects them. Returns the
    /// number of tasks that had to be aborted.
    pub async fn shutdown(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("Task {} stopped", name),
                Ok(Err(e)) => error!("Task {} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Task {} did not stop in time, aborting", name);
                    handle.abort();
                    self.health
                        .insert(name, TaskHealthStatus::Failed("aborted".to_string()));
                    aborted += 1;
                }
            }
        }

        info!("All supervised tasks stopped ({} aborted)", aborted);
        aborted
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cloudhub_core::HubError;

    #[tokio::test]
    async fn test_failure_is_recorded_and_isolated() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn("broken", async {
            Err::<(), _>(HubError::transport("websocket", "address in use"))
        });
        supervisor.spawn("steady", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = supervisor.health_summary();
        assert!(matches!(summary[0], (ref name, TaskHealthStatus::Failed(_)) if name == "broken"));
        assert_eq!(summary[1].1, TaskHealthStatus::Running);
        assert!(!supervisor.is_healthy());

        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 0);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_stragglers_are_aborted() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        assert_eq!(supervisor.shutdown(Duration::from_millis(20)).await, 1);
        assert_eq!(
            supervisor.health_summary(),
            vec![(
                "stuck".to_string(),
                TaskHealthStatus::Failed("aborted".to_string())
            )]
        );
    }
}
