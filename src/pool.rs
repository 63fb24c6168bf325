//! Bounded worker pool.
//!
//! A [`Semaphore`] caps the number of in-flight tasks and a [`JoinSet`]
//! owns them. [`WorkerPool::submit`] waits for a free slot, so a producer
//! that outruns its workers is slowed down instead of queueing without
//! bound. [`WorkerPool::wait`] joins every task and reports the first
//! error; a failing task never cancels its siblings.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

pub struct WorkerPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
    first_error: Option<anyhow::Error>,
    failed: usize,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` tasks at once (at least 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            tasks: JoinSet::new(),
            first_error: None,
            failed: 0,
        }
    }

    /// Spawn `task` once a slot is free.
    pub async fn submit<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("{} pool is closed", self.name))?;

        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });

        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
        Ok(())
    }

    /// Join all tasks. Returns the first task error, if any.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(result) = self.tasks.join_next().await {
            self.record(result);
        }
        if self.failed > 0 {
            tracing::debug!(pool = self.name, failed = self.failed, "pool finished with task errors");
        }
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, result: std::result::Result<Result<()>, JoinError>) {
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(join_err) => anyhow!("{} task panicked: {}", self.name, join_err),
        };
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 4);
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 3);
        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn first_error_is_reported_without_cancelling_siblings() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 2);

        pool.submit(async { Err::<(), _>(anyhow!("boom")) })
            .await
            .unwrap();
        for _ in 0..10 {
            let completed = completed.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        let err = pool.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let mut pool = WorkerPool::new("test", 0);
        pool.submit(async { Ok(()) }).await.unwrap();
        pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn panics_surface_as_errors() {
        let mut pool = WorkerPool::new("test", 1);
        pool.submit(async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        })
        .await
        .unwrap();
        let err = pool.wait().await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
