use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::*;

#[test]
fn spawned_threads_unregister_on_natural_completion() {
    let registry = Arc::new(ThreadRegistry::new());
    let thread = registry.spawn(|_t| {});
    thread.await_finish();
    assert_eq!(registry.running_count(), 0);
}

#[test]
fn await_all_terminated_drains_the_live_set() {
    let registry = Arc::new(ThreadRegistry::new());
    let stopped = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let stopped = stopped.clone();
        registry.spawn(move |t| {
            // interpreter loop stand-in: run until the stop signal arrives
            while !t.stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            stopped.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(registry.running_count(), 4);

    registry.await_all_terminated();
    assert_eq!(registry.running_count(), 0);
    assert_eq!(stopped.load(Ordering::SeqCst), 4);
}

#[test]
fn threads_finishing_before_shutdown_are_tolerated() {
    let registry = Arc::new(ThreadRegistry::new());

    // half exit immediately, half wait for the signal
    let mut waiters = Vec::new();
    for i in 0..6 {
        let handle = registry.spawn(move |t| {
            if i % 2 == 0 {
                return;
            }
            while !t.stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        waiters.push(handle);
    }

    registry.await_all_terminated();
    assert_eq!(registry.running_count(), 0);
    for thread in waiters {
        thread.await_finish();
    }
}

#[test]
fn shutdown_all_only_signals() {
    let registry = Arc::new(ThreadRegistry::new());
    let thread = registry.spawn(|t| {
        while !t.stop_requested() {
            thread::sleep(Duration::from_millis(1));
        }
    });

    registry.shutdown_all();
    assert!(thread.stop_requested());
    thread.await_finish();
    assert_eq!(registry.running_count(), 0);
}

#[test]
fn unregister_of_absent_thread_is_a_noop() {
    let registry = Arc::new(ThreadRegistry::new());
    let thread = registry.spawn(|_t| {});
    thread.await_finish();
    // the thread already unregistered itself
    registry.unregister(&thread);
    assert_eq!(registry.running_count(), 0);
}

#[test]
#[should_panic(expected = "already registered")]
fn double_registration_is_a_caller_bug() {
    let registry = Arc::new(ThreadRegistry::new());
    let thread = registry.spawn(|t| {
        // self-terminating loop so the thread does not outlive the test
        for _ in 0..500 {
            if t.stop_requested() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    });
    registry.register(thread);
}

#[test]
fn thread_ids_are_unique() {
    let registry = Arc::new(ThreadRegistry::new());
    let a = registry.spawn(|_t| {});
    let b = registry.spawn(|_t| {});
    assert_ne!(a.id(), b.id());
    a.await_finish();
    b.await_finish();
}
