//! Concurrency primitives shared by the mux
//!
//! [`SafeCloser`] is the once-only close discipline used by streams and
//! managers: senders hold the read lock while they enqueue, close takes the
//! write lock, so a sender observes either "still open, my enqueue lands" or
//! "closed, take the closed branch" with no torn state in between.

mod worker;

pub use worker::WorkerPool;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Once-only close signal with callbacks.
#[derive(Default)]
pub struct SafeCloser {
    state: RwLock<bool>,
    callbacks: Mutex<Vec<CloseCallback>>,
    token: CancellationToken,
}

impl SafeCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run exactly once when [`close`](Self::close)
    /// fires. Registered after close, it never runs.
    pub fn add_close_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Close once: flips the flag under the write lock, runs the callbacks,
    /// then wakes every task parked on [`closed`](Self::closed). Subsequent
    /// calls are no-ops.
    pub fn close(&self) {
        let callbacks = {
            let mut closed = self.state.write();
            if *closed {
                return;
            }
            *closed = true;
            std::mem::take(&mut *self.callbacks.lock())
        };
        for callback in callbacks {
            callback();
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        *self.state.read()
    }

    /// Read guard over the closed flag, for senders that must observe a
    /// consistent snapshot while they enqueue.
    pub fn read(&self) -> RwLockReadGuard<'_, bool> {
        self.state.read()
    }

    /// Resolves when the closer has fired.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

impl std::fmt::Debug for SafeCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeCloser")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
