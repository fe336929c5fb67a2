use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct TaskPool {
    /// Taken on shutdown; with every sender gone the runners drain what is
    /// queued and then see the channel close.
    tx: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    shutting_down: Arc<AtomicBool>,
    handles: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(worker_count: usize, queue_bound: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>(queue_bound);
        let rx = Arc::new(Mutex::new(rx));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                tracing::debug!("Runner {} started", worker_id);
                // Runs until the channel closes: shutdown refuses new work,
                // the queue drains, and each runner finishes the job in
                // hand before seeing `None`.
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                tracing::debug!("Runner {} stopped", worker_id);
            }));
        }

        Arc::new(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            shutting_down,
            handles: std::sync::Mutex::new(handles),
        })
    }

    /// Non-blocking enqueue. A full queue is the caller's backpressure
    /// signal, never a wait.
    pub fn try_submit<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(Error::ShutdownInProgress);
        };
        tx.try_send(Box::pin(fut)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::QuotaExceeded("task queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => Error::ShutdownInProgress,
        })
    }

    /// Submit work and wait for its value. The wait is bounded by the
    /// runner executing the job, not by the enqueue.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.try_submit(async move {
            let _ = tx.send(fut.await);
        })?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Refuse new work and close the queue. Runners keep going until the
    /// queue is drained.
    pub fn initiate_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait for every runner to drain out. Call after `initiate_shutdown`;
    /// with the queue still open this would wait forever.
    pub async fn join(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
