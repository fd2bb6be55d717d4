//! Background worker threads with cooperative shutdown

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// A dedicated OS thread that runs until its stop flag is raised
pub struct WorkerHandle {
    name: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread. The body must return once the flag
    /// it is given reads false.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))
            .with_context(|| format!("failed to spawn {} thread", name))?;

        info!("{} worker started", name);
        Ok(Self {
            name: name.to_string(),
            running,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the stop flag and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread was still running at the deadline; it is
    /// then left detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);

        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("{} worker did not stop within {:?}", self.name, timeout);
                return false;
            }
            thread::sleep(JOIN_POLL);
        }

        match thread.join() {
            Ok(()) => info!("{} worker stopped", self.name),
            Err(_) => error!("{} worker panicked", self.name),
        }
        true
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Sleep in short slices, returning early once `running` is cleared.
/// Returns whether the worker should keep going.
pub fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
    false
}
