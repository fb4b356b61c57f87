//! Named worker threads with cooperative shutdown.
//!
//! A [`Worker`] runs a user body on a named OS thread. Shutdown is
//! cooperative: [`Worker::stop`] flips the shared [`StopToken`] and the body
//! is expected to observe it at its next loop boundary. Components that sit
//! in a blocking receive pair the token with an out-of-band wakeup (see the
//! socket endpoint's `wake_receiver`).
//!
//! A cleanup hook supplied at spawn time runs exactly once per spawn,
//! whether the body returned normally or panicked. The current worker's name
//! is available from inside the body through [`current_name`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::error;

use crate::error::{IpcError, Result};

/// OS thread names cap at 15 bytes plus the terminator.
const MAX_NAME_CHARS: usize = 15;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Cooperative stop flag shared between a [`Worker`] and its body.
///
/// Clones share state: a stop requested through any clone is observed by
/// all of them.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    fn new() -> Self {
        Self::default()
    }

    /// Request the worker to stop at its next loop boundary.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// True once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A named, one-shot worker thread.
///
/// Restartable components hold an `Option<Worker>` and spawn a fresh worker
/// per start; `stop` and `join` after completion are no-ops.
pub struct Worker {
    name: String,
    token: StopToken,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker running `body`.
    ///
    /// The name is truncated to 15 characters before it reaches the OS.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        Self::spawn_with_cleanup(name, body, || {})
    }

    /// Spawn a worker running `body` with a cleanup hook.
    ///
    /// The hook runs exactly once when the body returns or panics. A body
    /// that takes locks it cannot release on early return should release
    /// them here.
    pub fn spawn_with_cleanup<F, C>(name: &str, body: F, cleanup: C) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let name: String = name.chars().take(MAX_NAME_CHARS).collect();
        let token = StopToken::new();
        let active = Arc::new(AtomicBool::new(true));

        let body_token = token.clone();
        let body_active = active.clone();
        let body_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(body_name));
                let _guard = RunGuard {
                    active: body_active,
                    cleanup: Some(cleanup),
                };
                body(body_token);
            })
            .map_err(|e| IpcError::Os {
                context: "worker spawn error",
                source: e,
            })?;

        Ok(Self {
            name,
            token,
            active,
            handle: Some(handle),
        })
    }

    /// The worker's (truncated) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the body is still running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// A clone of the worker's stop token.
    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    /// Request a cooperative stop. Does not wait; pair with [`join`].
    ///
    /// [`join`]: Worker::join
    pub fn stop(&self) {
        self.token.request_stop();
    }

    /// Wait for the body to finish. Idempotent.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread panicked [{}]", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// The name of the worker the calling code is running on, if any.
pub fn current_name() -> Option<String> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

struct RunGuard<C: FnOnce()> {
    active: Arc<AtomicBool>,
    cleanup: Option<C>,
}

impl<C: FnOnce()> Drop for RunGuard<C> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
        CURRENT_WORKER.with(|current| *current.borrow_mut() = None);
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_body_runs_and_worker_goes_idle() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn("unit", move |_token| {
            tx.send(42).ok();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        worker.join();
        assert!(!worker.is_active());
    }

    #[test]
    fn test_stop_token_observed() {
        let mut worker = Worker::spawn("stoppable", |token| {
            while !token.is_stopped() {
                std::thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(worker.is_active());
        worker.stop();
        worker.join();
        assert!(!worker.is_active());
    }

    #[test]
    fn test_cleanup_runs_on_normal_return() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn_with_cleanup(
            "clean",
            |_token| {},
            move || {
                tx.send("cleaned").ok();
            },
        )
        .unwrap();

        worker.join();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "cleaned");
    }

    #[test]
    fn test_cleanup_runs_on_panic() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn_with_cleanup(
            "panicky",
            |_token| panic!("boom"),
            move || {
                tx.send("cleaned").ok();
            },
        )
        .unwrap();

        worker.join();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "cleaned");
        assert!(!worker.is_active());
    }

    #[test]
    fn test_name_truncated_to_fifteen_chars() {
        let mut worker = Worker::spawn("a-very-long-worker-name", |_token| {}).unwrap();
        assert_eq!(worker.name(), "a-very-long-wor");
        assert_eq!(worker.name().len(), 15);
        worker.join();
    }

    #[test]
    fn test_current_name_visible_inside_body() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn("introspect", move |_token| {
            tx.send(current_name()).ok();
        })
        .unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen.as_deref(), Some("introspect"));
        worker.join();
        assert_eq!(current_name(), None);
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut worker = Worker::spawn("joiner", |_token| {}).unwrap();
        worker.join();
        worker.join();
    }
}
