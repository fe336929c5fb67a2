//! Executor Module Tests
//!
//! Unit tests for the bounded runner pool.
//!
//! ## Test Scopes
//! - **Execution**: submitted work runs and returns values.
//! - **Backpressure**: a full queue refuses work immediately.
//! - **Shutdown**: the cooperative flag stops new submissions.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::executor::TaskPool;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = TaskPool::new(2, 8);
        let value = pool.run(async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_jobs_execute_concurrently_across_runners() {
        let pool = TaskPool::new(4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            waiters.push(pool.run(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_full_queue_is_quota_exceeded() {
        // One runner, saturated by a job that never finishes in time. The
        // stuck runner is abandoned with the test runtime.
        let pool = TaskPool::new(1, 1);
        let _ = pool.try_submit(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        // Give the runner a beat to pick up the first job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = pool.try_submit(async {});

        let mut saw_full = false;
        for _ in 0..4 {
            if let Err(Error::QuotaExceeded(_)) = pool.try_submit(async {}) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let pool = TaskPool::new(1, 4);
        pool.initiate_shutdown();
        assert!(matches!(
            pool.try_submit(async {}),
            Err(Error::ShutdownInProgress)
        ));
        assert!(pool.is_shutting_down());
        pool.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work_before_join() {
        let pool = TaskPool::new(1, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        // Park the runner briefly so the remaining jobs sit in the queue
        // when shutdown closes it.
        let gate = counter.clone();
        pool.try_submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        for _ in 0..3 {
            let counter = counter.clone();
            pool.try_submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.initiate_shutdown();
        pool.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
