//! Registry of running interpreter threads.
//!
//! The context never schedules threads itself; interpreted code spawns them
//! and the registry only tracks the live set so shutdown can signal every
//! thread and join them. Cancellation is cooperative: `stop` raises a flag
//! the thread body is expected to observe; the registry never forcibly
//! terminates anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, trace};

/// One running interpreter thread.
#[derive(Debug)]
pub struct InterpreterThread {
    id: u64,
    stop: AtomicBool,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl InterpreterThread {
    fn new(id: u64) -> Self {
        Self {
            id,
            stop: AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cooperative stop signal; the thread body polls this.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Block until the thread body has finished.
    pub fn await_finish(&self) {
        let mut finished = self.finished.lock().unwrap();
        while !*finished {
            finished = self.finished_cv.wait(finished).unwrap();
        }
    }

    fn mark_finished(&self) {
        *self.finished.lock().unwrap() = true;
        self.finished_cv.notify_all();
    }
}

/// Set of currently running interpreter threads; coordinates bulk shutdown
/// and join. All operations serialize on one mutex around the live set.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    running: Mutex<Vec<Arc<InterpreterThread>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn an OS thread for `body` and track it. The thread unregisters
    /// itself as part of finishing, before the finish latch opens.
    pub fn spawn<F>(self: &Arc<Self>, body: F) -> Arc<InterpreterThread>
    where
        F: FnOnce(&InterpreterThread) + Send + 'static,
    {
        let thread = Arc::new(InterpreterThread::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        self.register(thread.clone());

        let registry = Arc::clone(self);
        let tracked = thread.clone();
        std::thread::spawn(move || {
            trace!(target: "cinder::threads", id = tracked.id(), "interpreter thread started");
            body(&tracked);
            registry.unregister(&tracked);
            tracked.mark_finished();
            trace!(target: "cinder::threads", id = tracked.id(), "interpreter thread finished");
        });
        thread
    }

    /// Track an externally created thread. Registering the same thread twice
    /// is a caller bug.
    pub fn register(&self, thread: Arc<InterpreterThread>) {
        let mut running = self.running.lock().unwrap();
        assert!(
            !running.iter().any(|t| Arc::ptr_eq(t, &thread)),
            "interpreter thread {} already registered",
            thread.id()
        );
        running.push(thread);
    }

    /// Remove a thread from the live set; removing an absent thread is a
    /// no-op.
    pub fn unregister(&self, thread: &Arc<InterpreterThread>) {
        let mut running = self.running.lock().unwrap();
        running.retain(|t| !Arc::ptr_eq(t, thread));
        debug_assert!(!running.iter().any(|t| Arc::ptr_eq(t, thread)));
    }

    /// Send the stop signal to every running thread. Iterates over a
    /// snapshot: stopping a thread may make it unregister itself.
    pub fn shutdown_all(&self) {
        let snapshot = self.running.lock().unwrap().clone();
        debug!(target: "cinder::threads", count = snapshot.len(), "shutting down interpreter threads");
        for thread in snapshot {
            thread.stop();
        }
    }

    /// Signal every thread, then block until the live set drains. Each
    /// finishing thread unregisters itself; that is asserted, not re-checked
    /// defensively.
    pub fn await_all_terminated(&self) {
        self.shutdown_all();

        loop {
            let Some(first) = self.running.lock().unwrap().first().cloned() else {
                break;
            };
            first.await_finish();
            debug_assert!(
                !self.running.lock().unwrap().iter().any(|t| Arc::ptr_eq(t, &first)),
                "finished thread should have unregistered itself"
            );
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Snapshot of the currently running threads.
    pub fn running_threads(&self) -> Vec<Arc<InterpreterThread>> {
        self.running.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod concurrency_test;
