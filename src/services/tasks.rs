//! Periodic background maintenance tasks with an explicit stop lifecycle.

use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a spawned periodic task.
///
/// The task holds only a `Weak` reference to its owner and ends on its own
/// once the owner is dropped.
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` every `period`, first after one full period has elapsed.
    pub fn spawn_periodic<T, F, Fut>(
        name: &'static str,
        period: Duration,
        owner: Weak<T>,
        tick: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(owner) = owner.upgrade() else { break };
                        tick(owner).await;
                    }
                }
            }
            debug!(task = name, "background task stopped");
        });

        debug!(task = name, period_secs = period.as_secs(), "background task started");
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task and wait for it to finish its current tick.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(task = self.name, "background task ended abnormally: {}", err);
        }
    }
}

/// Stop every task concurrently.
pub async fn stop_all(tasks: Vec<BackgroundTask>) {
    futures::future::join_all(tasks.into_iter().map(BackgroundTask::stop)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_task_ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "counter",
            Duration::from_millis(10),
            Arc::downgrade(&counter),
            |counter: Arc<AtomicUsize>| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        time::sleep(Duration::from_millis(60)).await;
        task.stop().await;

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 1);
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_task_exits_when_owner_dropped() {
        let owner = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "orphan",
            Duration::from_millis(5),
            Arc::downgrade(&owner),
            |_owner: Arc<AtomicUsize>| async {},
        );
        drop(owner);
        time::sleep(Duration::from_millis(30)).await;
        assert!(task.handle.is_finished());
        assert_eq!(task.name(), "orphan");
    }
}
