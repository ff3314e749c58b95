//! Fixed-size worker pool, semaphore pattern
//!
//! An intake queue of capacity `2 * size`, `size` permit tokens, and `size`
//! long-running workers. A worker dequeues an item, consumes one permit,
//! runs the handler, and returns the permit. `submit` never blocks; the
//! server adapter uses its refusal as the admission-control signal.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed-size async worker pool.
pub struct WorkerPool<T> {
    intake: Mutex<Option<mpsc::Sender<T>>>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers running `handler` on submitted items.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero; an unbounded pool is the caller's decision,
    /// not a pool of no workers.
    pub fn new<F>(size: usize, handler: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        assert!(size > 0, "worker pool size must be positive");

        let (intake_tx, intake_rx) = mpsc::channel::<T>(size * 2);
        let intake_rx = Arc::new(tokio::sync::Mutex::new(intake_rx));

        let (permit_tx, permit_rx) = mpsc::channel::<()>(size);
        for _ in 0..size {
            // Capacity equals the token count, this cannot fail.
            let _ = permit_tx.try_send(());
        }
        let permit_rx = Arc::new(tokio::sync::Mutex::new(permit_rx));

        let handler: Handler<T> = Arc::new(handler);
        let token = CancellationToken::new();

        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let intake_rx = intake_rx.clone();
            let permit_rx = permit_rx.clone();
            let permit_tx = permit_tx.clone();
            let handler = handler.clone();
            let token = token.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = token.cancelled() => break,
                        item = async { intake_rx.lock().await.recv().await } => {
                            match item {
                                Some(item) => item,
                                None => break,
                            }
                        }
                    };

                    let _ = permit_rx.lock().await.recv().await;
                    handler(item).await;
                    let _ = permit_tx.send(()).await;
                }
            }));
        }

        Self {
            intake: Mutex::new(Some(intake_tx)),
            token,
            workers: Mutex::new(workers),
        }
    }

    /// Non-blocking submit. Returns `false` when the intake queue is full or
    /// the pool is closed.
    pub fn submit(&self, item: T) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        match self.intake.lock().as_ref() {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }

    /// Blocking submit: waits for intake room. Returns `false` if the pool
    /// closes first.
    pub async fn submit_block(&self, item: T) -> bool {
        let tx = match self.intake.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        }
    }

    /// Cancel the pool, wait for every worker to exit, then close the intake
    /// exactly once.
    pub async fn close(&self) {
        self.token.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        self.intake.lock().take();
    }
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("closed", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_pool_runs_submitted_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        let pool = {
            let ran = ran.clone();
            let done = done.clone();
            WorkerPool::new(2, move |n: usize| {
                let ran = ran.clone();
                let done = done.clone();
                Box::pin(async move {
                    ran.fetch_add(n, Ordering::SeqCst);
                    done.notify_one();
                })
            })
        };

        assert!(pool.submit(1));
        assert!(pool.submit(2));
        done.notified().await;
        done.notified().await;

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_full_intake_refuses_submit() {
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let started = Arc::new(Notify::new());

        let pool = {
            let release = release.clone();
            let started = started.clone();
            WorkerPool::new(1, move |_: usize| {
                let release = release.clone();
                let started = started.clone();
                Box::pin(async move {
                    started.notify_one();
                    release.acquire().await.unwrap().forget();
                })
            })
        };

        // First item occupies the single worker.
        assert!(pool.submit(1));
        started.notified().await;

        // Intake capacity is 2 * size = 2.
        assert!(pool.submit(2));
        assert!(pool.submit(3));
        assert!(!pool.submit(4));

        release.add_permits(3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_submit_after_close_is_refused() {
        let pool = WorkerPool::new(1, |_: usize| Box::pin(async {}) as BoxFuture<'static, ()>);
        pool.close().await;
        assert!(!pool.submit(1));
        assert!(!pool.submit_block(2).await);
    }
}
