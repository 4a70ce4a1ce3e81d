//! Bounded pool of background tasks with cooperative cancellation

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Fixed number of worker slots sharing one shutdown signal
///
/// Tasks receive a [`watch::Receiver`] that flips to `true` when the pool
/// shuts down and are expected to return promptly once it does.
pub struct TaskPool {
    capacity: usize,
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            capacity: capacity.max(1),
            tasks: JoinSet::new(),
            shutdown,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks still running
    pub fn len(&mut self) -> usize {
        self.reap();
        self.tasks.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Whether shutdown has been signalled
    pub fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// A receiver for the pool's shutdown signal, for work run outside the pool
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn `task` if a slot is free; returns whether it was accepted
    pub fn spawn<F, Fut>(&mut self, name: &str, task: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancelled() {
            tracing::warn!("Task pool is shutting down, not starting {}", name);
            return false;
        }
        if self.len() >= self.capacity {
            tracing::warn!(
                "All {} worker slots busy, not starting {}",
                self.capacity,
                name
            );
            return false;
        }

        self.tasks.spawn(task(self.shutdown.subscribe()));
        tracing::debug!("Started background task {}", name);
        true
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Background task panicked: {}", e);
                }
            }
        }
    }

    /// Signal cancellation and wait up to `grace` for every task to finish,
    /// aborting whatever is left. Returns `true` if all tasks finished in time.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!("Background task failed during shutdown: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                "{} background tasks still running after {:?}, aborting",
                self.tasks.len(),
                grace
            );
            self.tasks.shutdown().await;
        }
        drained
    }
}
