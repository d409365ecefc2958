//! Shutdown coordination for the gateway's long-running tasks.
//!
//! Every listener, session and broker consume loop hangs off one root
//! [`CancellationToken`]. Tasks are registered by name in a [`TaskSet`];
//! [`ShutdownCoordinator::drain`] cancels the root, waits for the set against
//! a single deadline, aborts whatever is left and reports per-task outcomes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on draining tasks at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Named task handles awaited at shutdown.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` under `name`.
    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Track several handles under one name.
    pub fn extend(&mut self, name: &'static str, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.extend(handles.into_iter().map(|h| (name, h)));
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// What became of each task during [`ShutdownCoordinator::drain`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that returned on their own.
    pub completed: usize,
    /// Tasks that had panicked.
    pub panicked: Vec<&'static str>,
    /// Tasks still running at the deadline, or cancelled elsewhere.
    pub aborted: Vec<&'static str>,
}

impl ShutdownReport {
    /// Whether every task returned on its own.
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.aborted.is_empty()
    }
}

/// Root cancellation token for the listener, sessions and broker consumers.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Fresh coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token, cancelled with the root.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signal every holder of the token.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the root token and wait for `tasks` until `timeout` elapses.
    ///
    /// Tasks are awaited in registration order against one deadline; a task
    /// that already finished is counted as completed even past it. Anything
    /// still running at the deadline is aborted.
    pub async fn drain(&self, tasks: TaskSet, timeout: Duration) -> ShutdownReport {
        self.shutdown();
        info!(task_count = tasks.len(), timeout_ms = timeout.as_millis(), "draining tasks");

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for (name, mut handle) in tasks.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = name, "task finished");
                    report.completed += 1;
                }
                Ok(Err(err)) if err.is_panic() => {
                    error!(task = name, "task panicked before shutdown");
                    report.panicked.push(name);
                }
                Ok(Err(_)) => report.aborted.push(name),
                Err(_) => {
                    warn!(task = name, "task still running at shutdown deadline, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        if report.is_clean() {
            info!(completed = report.completed, "all tasks drained");
        } else {
            warn!(
                completed = report.completed,
                panicked = ?report.panicked,
                aborted = ?report.aborted,
                "shutdown finished with unclean tasks"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_follow_root() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let child = coord.child_token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cooperative_tasks_drain_cleanly() {
        let coord = ShutdownCoordinator::new();
        let mut tasks = TaskSet::new();
        let token = coord.child_token();
        tasks.push("listener", tokio::spawn(async move { token.cancelled().await }));
        let token = coord.child_token();
        tasks.extend(
            "consumer",
            [tokio::spawn(async move { token.cancelled().await }), tokio::spawn(async {})],
        );
        assert_eq!(tasks.len(), 3);

        let report = coord.drain(tasks, DEFAULT_SHUTDOWN_TIMEOUT).await;
        assert!(coord.is_shutting_down());
        assert_eq!(report.completed, 3);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_at_the_deadline() {
        let coord = ShutdownCoordinator::new();
        let stuck = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(300)).await });
        let abort = stuck.abort_handle();
        let mut tasks = TaskSet::new();
        tasks.push("stuck", stuck);
        tasks.push("done", tokio::spawn(async {}));

        let report = coord.drain(tasks, Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(abort.is_finished());
        assert_eq!(report.aborted, vec!["stuck"]);
        assert_eq!(report.completed, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn panicked_tasks_are_reported_by_name() {
        let coord = ShutdownCoordinator::new();
        let mut tasks = TaskSet::new();
        tasks.push("worker", tokio::spawn(async { panic!("boom") }));
        tokio::task::yield_now().await;

        let report = coord.drain(tasks, Duration::from_secs(1)).await;
        assert_eq!(report.panicked, vec!["worker"]);
        assert_eq!(report.completed, 0);
        assert!(report.aborted.is_empty());
    }
}
