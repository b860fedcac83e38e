use fiberloom::{Counter, FiberMutex, Job, JobBuilder, Manager, parallel_for, parallel_map_reduce};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("fiberloom - M:N Fiber Job Scheduler\n");

    let manager = match Manager::new(0) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("failed to start scheduler: {err}");
            std::process::exit(1);
        }
    };
    println!(
        "Initialized scheduler with {} workers and {} fibers\n",
        manager.worker_count(),
        manager.fiber_count()
    );

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    let counter = manager.run(|| {
        println!("  Hello from a fiber job!");
    });
    manager.wait_for(&counter, 0);
    println!("  Job completed\n");

    // Example 2: Dependency chain
    println!("Example 2: Dependency chain");
    let log = Arc::new(FiberMutex::new(Vec::new()));
    let a = Counter::new(0);
    let b = Counter::new(0);
    let c = Counter::new(0);
    let step = |name: &'static str| {
        let log = log.clone();
        Job::new(move || log.lock().push(name))
    };
    manager.enqueue_with_counter(step("A"), &a);
    manager.enqueue_with_counter(step("B").after(&a), &b);
    manager.enqueue_with_counter(step("C").after(&b), &c);
    manager.wait_for(&c, 0);
    if let Some(order) = log.try_lock() {
        println!("  Completion order: {:?}\n", *order);
    }

    // Example 3: Continuation builder
    println!("Example 3: Continuation builder");
    let processed = Arc::new(AtomicUsize::new(0));
    let builder = JobBuilder::new(Job::new(|| println!("  load")))
        .then_all((0..8).map(|_| {
            let processed = processed.clone();
            Job::new(move || {
                processed.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .then(Job::new(|| println!("  store")));
    let pipeline = manager.enqueue_builder_group(builder, "pipeline");
    manager.wait_for(&pipeline, 0);
    println!(
        "  Processed {} items in the middle stage\n",
        processed.load(Ordering::SeqCst)
    );

    // Example 4: Parallel for and map-reduce
    println!("Example 4: Parallel helpers");
    let hits = AtomicUsize::new(0);
    parallel_for(&manager, 0..1000, |_| {
        hits.fetch_add(1, Ordering::Relaxed);
    });
    println!("  parallel_for visited {} indices", hits.load(Ordering::Relaxed));

    let data: Vec<u64> = (0..1_000_000).collect();
    let start = Instant::now();
    let sum_of_squares = parallel_map_reduce(&manager, &data, 0u64, |x| x * x, |a, b| a + b);
    println!(
        "  Sum of squares over {} items: {} in {:?}\n",
        data.len(),
        sum_of_squares,
        start.elapsed()
    );

    match manager.shutdown() {
        Ok(()) => println!("Scheduler shut down cleanly"),
        Err(err) => eprintln!("Shutdown reported an error: {err}"),
    }
}
