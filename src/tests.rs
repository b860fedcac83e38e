//! Integration tests for the fiber-based job scheduler.

use crate::{Counter, FiberMutex, Job, JobBuilder, Manager, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        fiber_count: 64,
        stack_size: 64 * 1024,
        dependency_timeout: Duration::from_micros(200),
        idle_timeout: Duration::from_millis(1),
        ..SchedulerConfig::default()
    }
}

#[test]
fn test_basic_job_execution() {
    let manager = Manager::new_with_config(2, test_config()).unwrap();
    let value = Arc::new(AtomicUsize::new(0));
    let value_clone = value.clone();

    let counter = manager.run(move || {
        value_clone.store(42, Ordering::SeqCst);
    });

    manager.wait_for(&counter, 0);
    assert_eq!(value.load(Ordering::SeqCst), 42);
    manager.shutdown().expect("Shutdown failed");
}

#[test]
fn test_parallel_job_execution() {
    let manager = Manager::new_with_config(4, test_config()).unwrap();
    let sum = Arc::new(AtomicUsize::new(0));

    let num_jobs = 100;
    let jobs = (0..num_jobs).map(|i| {
        let sum_clone = sum.clone();
        Job::new(move || {
            sum_clone.fetch_add(i, Ordering::SeqCst);
        })
    });

    let counter = Counter::new(0);
    manager.enqueue_batch(jobs, &counter);
    manager.wait_for(&counter, 0);

    let expected_sum: usize = (0..num_jobs).sum();
    assert_eq!(sum.load(Ordering::SeqCst), expected_sum);
    manager.shutdown().expect("Shutdown failed");
}

#[test]
fn test_dependent_job_waits_for_counter() {
    let manager = Manager::new_with_config(2, test_config()).unwrap();
    let gate = Counter::new(1);
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_clone = ran.clone();
    let done = Counter::new(0);
    manager.enqueue_with_counter(
        Job::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .after(&gate),
        &done,
    );

    // Long enough for several dependency polls and parks.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(done.get(), 1);

    gate.decrement();
    manager.wait_for(&done, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_nested_jobs_from_context() {
    let manager = Manager::new_with_config(1, test_config()).unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let total_clone = total.clone();
    let counter = Counter::new(0);
    manager.enqueue_with_counter(
        Job::with_context(move |ctx| {
            let children = Counter::new(0);
            for _ in 0..10 {
                let total = total_clone.clone();
                ctx.enqueue_with_counter(
                    Job::new(move || {
                        total.fetch_add(1, Ordering::SeqCst);
                    }),
                    &children,
                );
            }
            // A single worker only gets through the children if this parks.
            ctx.wait_for(&children, 0);
            total_clone.fetch_add(100, Ordering::SeqCst);
        }),
        &counter,
    );

    manager.wait_for(&counter, 0);
    assert_eq!(total.load(Ordering::SeqCst), 110);
}

#[test]
fn test_builder_runs_stages_in_order() {
    let manager = Manager::new_with_config(4, test_config()).unwrap();
    let log = Arc::new(FiberMutex::new(Vec::new()));

    let record = |stage: usize| {
        let log = log.clone();
        Job::new(move || log.lock().push(stage))
    };

    let builder = JobBuilder::new(record(0))
        .then_all((0..4).map(|_| record(1)))
        .then(record(2));
    let done = Counter::new(0);
    manager.enqueue_builder_with_counter(builder, &done);
    manager.wait_for(&done, 0);

    let log = log.try_lock().expect("no job holds the log").clone();
    assert_eq!(log, vec![0, 1, 1, 1, 1, 2]);
    assert_eq!(manager.live_continuations(), 0);
}

#[test]
fn test_shutdown_with_parked_fibers() {
    let manager = Manager::new_with_config(2, test_config()).unwrap();
    let never = Counter::new(1);
    for _ in 0..8 {
        manager.enqueue(Job::new(|| {}).after(&never));
    }
    thread::sleep(Duration::from_millis(10));
    manager.shutdown().expect("Shutdown failed");
}
