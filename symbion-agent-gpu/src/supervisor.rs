//! Lifecycle supervision for the agent's background tasks
//!
//! One [`Supervisor`] exists per process. It owns the shared cancellation
//! token and the task tracker; every background task is started through a
//! [`TaskSpawner`] so that:
//! - a panic is caught at the task boundary and logged, never propagated
//! - the task counts towards the drain the supervisor waits for on shutdown
//!
//! ```text
//! Running --signal--> ShuttingDown --all tasks done--> Drained
//!                                  \--grace elapsed--> ForcedExit
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Grace period between the cancellation signal and a forced exit
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Drained,
    ForcedExit,
}

/// Cloneable handle used to start tracked, panic-contained tasks
#[derive(Clone)]
pub struct TaskSpawner {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskSpawner {
    /// Token every task must observe at its suspension points
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(catch_panics(name, task));
    }
}

/// Run a task, logging instead of propagating a panic
pub async fn catch_panics<F>(name: &'static str, task: F)
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(()) => debug!(task = name, "background task finished"),
        Err(panic) => error!(task = name, panic = %panic_message(panic.as_ref()), "background task panicked"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct Supervisor {
    spawner: TaskSpawner,
    state: LifecycleState,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            spawner: TaskSpawner {
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
            state: LifecycleState::Running,
        }
    }

    pub fn spawner(&self) -> TaskSpawner {
        self.spawner.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Cancel every task and wait up to `grace` for all of them to finish
    ///
    /// Only the first call does anything; later calls return the terminal state.
    pub async fn shutdown(&mut self, grace: Duration) -> LifecycleState {
        if self.state != LifecycleState::Running {
            return self.state;
        }

        self.state = LifecycleState::ShuttingDown;
        info!(active_tasks = self.spawner.active_tasks(), "shutting down");

        self.spawner.cancel.cancel();
        self.spawner.tracker.close();

        self.state = match tokio::time::timeout(grace, self.spawner.tracker.wait()).await {
            Ok(()) => {
                info!("all background tasks finished gracefully");
                LifecycleState::Drained
            }
            Err(_) => {
                warn!(
                    remaining = self.spawner.active_tasks(),
                    grace_secs = grace.as_secs(),
                    "shutdown timeout, forcing exit"
                );
                LifecycleState::ForcedExit
            }
        };
        self.state
    }
}

/// Wait for SIGINT or SIGTERM, returning the signal's name
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_drains_cooperative_tasks() {
        let mut supervisor = Supervisor::new();
        let spawner = supervisor.spawner();

        for _ in 0..4 {
            let cancel = spawner.token();
            spawner.spawn("worker", async move { cancel.cancelled().await });
        }
        assert_eq!(supervisor.state(), LifecycleState::Running);
        assert_eq!(spawner.active_tasks(), 4);

        let state = supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await;
        assert_eq!(state, LifecycleState::Drained);
        assert_eq!(spawner.active_tasks(), 0);
        assert!(spawner.is_shutting_down());
    }

    #[tokio::test]
    async fn test_drains_with_no_tasks() {
        let mut supervisor = Supervisor::new();
        assert_eq!(supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await, LifecycleState::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_exit_at_grace_bound() {
        let mut supervisor = Supervisor::new();
        let spawner = supervisor.spawner();

        // an external call that never returns and ignores cancellation
        spawner.spawn("stuck", std::future::pending::<()>());
        let cancel = spawner.token();
        spawner.spawn("polite", async move { cancel.cancelled().await });

        let start = Instant::now();
        let state = supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await;

        assert_eq!(state, LifecycleState::ForcedExit);
        assert_eq!(start.elapsed(), DEFAULT_SHUTDOWN_GRACE);
        assert_eq!(spawner.active_tasks(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut supervisor = Supervisor::new();
        let spawner = supervisor.spawner();
        let sibling_ran = Arc::new(AtomicBool::new(false));

        spawner.spawn("doomed", async {
            panic!("sensor exploded");
        });

        let flag = sibling_ran.clone();
        let cancel = spawner.token();
        spawner.spawn("sibling", async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
            cancel.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sibling_ran.load(Ordering::SeqCst));
        // the panicked task already counts as finished
        assert_eq!(spawner.active_tasks(), 1);

        assert_eq!(supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await, LifecycleState::Drained);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut supervisor = Supervisor::new();
        assert_eq!(supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await, LifecycleState::Drained);
        assert_eq!(supervisor.shutdown(DEFAULT_SHUTDOWN_GRACE).await, LifecycleState::Drained);
        assert_eq!(supervisor.state(), LifecycleState::Drained);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
