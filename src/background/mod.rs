use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

/// What a background thread does for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    WalWriter,
    Checkpoint,
    DeadlockDetector,
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleeps up to `interval`; true once a stop was raised.
    fn sleep(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, interval);
        }
        *stopped
    }
}

/// A running periodic thread. Dropping the handle stops and joins it.
pub struct WorkerHandle {
    kind: WorkerKind,
    interval: Duration,
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl WorkerHandle {
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Asks the thread to stop without waiting for it.
    pub fn request_stop(&self) {
        self.signal.raise();
    }

    pub fn stop(&mut self) {
        self.request_stop();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            warn!("background worker {:?} panicked", self.kind);
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The set of workers a database owns.
#[derive(Debug, Default)]
pub struct BackgroundWorkers {
    workers: Vec<WorkerHandle>,
}

impl BackgroundWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `handle` when the worker actually started.
    pub fn register_opt(&mut self, handle: Option<WorkerHandle>) {
        self.workers.extend(handle);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn kinds(&self) -> Vec<WorkerKind> {
        self.workers.iter().map(WorkerHandle::kind).collect()
    }

    /// Signals every worker first so they wind down together, then joins.
    pub fn shutdown_all(&mut self) {
        self.workers.iter().for_each(WorkerHandle::request_stop);
        for mut worker in self.workers.drain(..) {
            worker.stop();
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Runs `tick` every `interval` on a named thread. A stop request cuts the
/// current sleep short. Returns `None` when the thread cannot be spawned.
pub(crate) fn spawn_periodic_worker<F>(
    name: &str,
    kind: WorkerKind,
    interval: Duration,
    mut tick: F,
) -> Option<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let signal = Arc::new(StopSignal::default());
    let thread_signal = signal.clone();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        while !thread_signal.sleep(interval) {
            tick();
        }
    });
    match spawned {
        Ok(thread) => {
            debug!("started {} every {:?}", name, interval);
            Some(WorkerHandle {
                kind,
                interval,
                signal,
                thread: Some(thread),
            })
        }
        Err(err) => {
            warn!("cannot start {}: {}", name, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut workers = BackgroundWorkers::new();
        workers.register_opt(spawn_periodic_worker(
            "ticker",
            WorkerKind::Checkpoint,
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(workers.kinds(), vec![WorkerKind::Checkpoint]);
        workers.shutdown_all();
        assert!(workers.is_empty());
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn stop_interrupts_a_long_sleep() {
        let worker =
            spawn_periodic_worker("sleeper", WorkerKind::WalWriter, Duration::from_secs(60), || {})
                .unwrap();
        assert_eq!(worker.interval(), Duration::from_secs(60));
        let started = Instant::now();
        drop(worker);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
