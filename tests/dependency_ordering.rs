use fiberloom::{Counter, FiberMutex, Job, Manager, SchedulerConfig};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const REPETITIONS: usize = 10_000;
const BATCH: usize = 100;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        fiber_count: 128,
        stack_size: 64 * 1024,
        dependency_timeout: Duration::from_micros(200),
        idle_timeout: Duration::from_millis(1),
        ..SchedulerConfig::default()
    }
}

/// A, B and C where B waits on A's counter and C on B's. The three land on
/// different workers, so B and C are usually dequeued before their gate opens.
#[test]
fn test_chain_completes_in_order() {
    let manager = Manager::new_with_config(4, config()).unwrap();
    let mut violations = 0;

    for _ in 0..REPETITIONS / BATCH {
        let done = Counter::new(0);
        let logs: Vec<Arc<FiberMutex<Vec<char>>>> =
            (0..BATCH).map(|_| Arc::new(FiberMutex::new(Vec::new()))).collect();

        // Jobs only hold weak references to their counters.
        let mut gates = Vec::with_capacity(BATCH);
        for log in &logs {
            let a = Counter::new(0);
            let b = Counter::new(0);
            let step = |name: char| {
                let log = log.clone();
                Job::new(move || log.lock().push(name))
            };

            // Each counter is raised before its dependent becomes visible.
            manager.enqueue_with_counter(step('A'), &a);
            manager.enqueue_with_counter(step('B').after(&a), &b);
            manager.enqueue_with_counter(step('C').after(&b), &done);
            gates.push((a, b));
        }

        manager.wait_for(&done, 0);
        drop(gates);
        for log in &logs {
            let log = log.try_lock().expect("log released");
            if *log != ['A', 'B', 'C'] {
                violations += 1;
            }
        }
    }

    assert_eq!(violations, 0);
    assert_eq!(manager.parked_fibers(), 0);
}

#[test]
fn test_intermediate_expected_value() {
    let manager = Manager::new_with_config(2, config()).unwrap();
    let producers = Counter::new(0);
    let gate = Counter::new(1);

    for _ in 0..3 {
        manager.enqueue_with_counter(Job::new(|| {}).after(&gate), &producers);
    }

    // Runs once at most one producer is left.
    let observed = Arc::new(FiberMutex::new(None));
    let observed_clone = observed.clone();
    let producers_clone = producers.clone();
    let done = Counter::new(0);
    manager.enqueue_with_counter(
        Job::new(move || {
            *observed_clone.lock() = Some(producers_clone.get());
        })
        .depends_on(&producers, 1),
        &done,
    );

    thread::sleep(Duration::from_millis(5));
    assert_eq!(done.get(), 1);

    gate.decrement();
    manager.wait_for(&done, 0);
    let seen = observed.try_lock().and_then(|v| *v).expect("job ran");
    assert!(seen <= 1);
    manager.wait_for(&producers, 0);
}

#[test]
fn test_dropped_dependency_counts_as_met() {
    let manager = Manager::new_with_config(2, config()).unwrap();
    let done = Counter::new(0);

    let stale = Counter::new(5);
    let job = Job::new(|| {}).after(&stale);
    drop(stale);

    manager.enqueue_with_counter(job, &done);
    manager.wait_for(&done, 0);
    assert!(done.is_complete());
}
