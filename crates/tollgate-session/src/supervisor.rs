use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Bounded pool for detached settlement and withdrawal work.
///
/// Tasks are spawned immediately but wait for a permit before running, so
/// at most `max_concurrent` make progress at once. Each task runs under its
/// own timeout. Shutdown drains with a grace period instead of aborting.
#[derive(Clone)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl TaskSupervisor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run `fut` in the background, cut off after `timeout`.
    pub fn spawn<F>(&self, name: &'static str, timeout: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(task = name, "Task pool closed; dropping task");
                return;
            };
            if tokio::time::timeout(timeout, fut).await.is_err() {
                tracing::error!(task = name, timeout_secs = timeout.as_secs(), "Background task timed out");
            }
        });
    }

    /// Number of tasks spawned and not yet finished.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every task spawned so far has finished.
    ///
    /// New tasks may still be spawned afterwards.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait up to `grace` for in-flight tasks.
    /// Returns `false` if some tasks were still running when the grace ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, grace_secs = grace.as_secs(), "Waiting for background tasks");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    "Background tasks still running after grace period"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_idle() {
        let supervisor = TaskSupervisor::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            supervisor.spawn("count", Duration::from_secs(5), async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        supervisor.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(supervisor.is_empty());

        // Still usable afterwards.
        let again = done.clone();
        supervisor.spawn("count", Duration::from_secs(5), async move {
            again.fetch_add(1, Ordering::SeqCst);
        });
        supervisor.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let supervisor = TaskSupervisor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            supervisor.spawn("bounded", Duration::from_secs(5), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        supervisor.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout() {
        let supervisor = TaskSupervisor::new(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        supervisor.spawn("slow", Duration::from_secs(1), async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        });
        supervisor.wait_idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_grace() {
        let supervisor = TaskSupervisor::new(1);
        supervisor.spawn("long", Duration::from_secs(600), async {
            tokio::time::sleep(Duration::from_secs(120)).await;
        });
        assert!(!supervisor.drain(Duration::from_secs(10)).await);
        assert!(supervisor.drain(Duration::from_secs(300)).await);
    }
}
