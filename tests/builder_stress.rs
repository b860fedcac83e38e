use fiberloom::{Counter, Job, JobBuilder, Manager, SchedulerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn manager() -> Manager {
    let config = SchedulerConfig {
        fiber_count: 128,
        stack_size: 64 * 1024,
        dependency_timeout: Duration::from_micros(200),
        idle_timeout: Duration::from_millis(1),
        ..SchedulerConfig::default()
    };
    Manager::new_with_config(4, config).unwrap()
}

/// Per-chain progress: `finished[i]` counts completed jobs of stage `i`.
struct Chain {
    sizes: Vec<usize>,
    finished: Vec<AtomicUsize>,
    violations: AtomicUsize,
}

impl Chain {
    fn job(self: &Arc<Self>, stage: usize) -> Job {
        let chain = self.clone();
        Job::new(move || {
            if stage > 0 && chain.finished[stage - 1].load(Ordering::SeqCst) != chain.sizes[stage - 1]
            {
                chain.violations.fetch_add(1, Ordering::SeqCst);
            }
            chain.finished[stage].fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[test]
fn test_random_chains_respect_stage_order() {
    let manager = manager();
    let mut rng = StdRng::seed_from_u64(7);
    let done = Counter::new(0);

    let chains: Vec<Arc<Chain>> = (0..200)
        .map(|_| {
            let stages = rng.random_range(1..6);
            // Stage 0 is the head job.
            let sizes: Vec<usize> = std::iter::once(1)
                .chain((1..stages).map(|_| rng.random_range(1..8)))
                .collect();
            Arc::new(Chain {
                finished: sizes.iter().map(|_| AtomicUsize::new(0)).collect(),
                sizes,
                violations: AtomicUsize::new(0),
            })
        })
        .collect();

    for chain in &chains {
        let builder = (1..chain.sizes.len()).fold(
            JobBuilder::new(chain.job(0)),
            |builder, stage| builder.then_all((0..chain.sizes[stage]).map(|_| chain.job(stage))),
        );
        manager.enqueue_builder_with_counter(builder, &done);
    }

    manager.wait_for(&done, 0);

    for chain in &chains {
        assert_eq!(chain.violations.load(Ordering::SeqCst), 0);
        for (stage, size) in chain.sizes.iter().enumerate() {
            assert_eq!(chain.finished[stage].load(Ordering::SeqCst), *size);
        }
    }
    assert_eq!(manager.live_continuations(), 0);
}

#[test]
fn test_counter_covers_whole_chain() {
    let manager = manager();
    let gate = Counter::new(1);
    let last_ran = Arc::new(AtomicUsize::new(0));

    let last_ran_clone = last_ran.clone();
    let builder = JobBuilder::new(Job::new(|| {}))
        .then(Job::new(|| {}).after(&gate))
        .then(Job::new(move || {
            last_ran_clone.store(1, Ordering::SeqCst);
        }));

    let done = manager.enqueue_builder_group(builder, "chain");
    // The head may already be done, but the chain is not.
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(done.get(), 1);
    assert_eq!(manager.live_continuations(), 1);

    gate.decrement();
    manager.wait_for(&done, 0);
    assert_eq!(last_ran.load(Ordering::SeqCst), 1);
    assert_eq!(manager.live_continuations(), 0);
}

#[test]
fn test_empty_stages_are_skipped() {
    let manager = manager();
    let ran = Arc::new(AtomicUsize::new(0));

    let job = |ran: &Arc<AtomicUsize>| {
        let ran = ran.clone();
        Job::new(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
    };
    let builder = JobBuilder::new(job(&ran))
        .then_all(Vec::new())
        .then(job(&ran))
        .then_all(Vec::new());
    assert_eq!(builder.stage_count(), 3);

    let done = Counter::new(0);
    manager.enqueue_builder_with_counter(builder, &done);
    manager.wait_for(&done, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    // A chain with only empty stages completes with its head.
    let only_head = JobBuilder::new(job(&ran)).then_all(Vec::new());
    manager.enqueue_builder_with_counter(only_head, &done);
    manager.wait_for(&done, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(manager.live_continuations(), 0);
}

#[test]
fn test_builders_enqueued_from_jobs() {
    let manager = manager();
    let total = Arc::new(AtomicUsize::new(0));
    let done = Counter::new(0);

    for _ in 0..20 {
        let total = total.clone();
        let outer = done.clone();
        manager.enqueue_with_counter(
            Job::with_context(move |ctx| {
                let bump = |total: &Arc<AtomicUsize>| {
                    let total = total.clone();
                    Job::new(move || {
                        total.fetch_add(1, Ordering::SeqCst);
                    })
                };
                let builder = JobBuilder::new(bump(&total))
                    .then_all((0..3).map(|_| bump(&total)))
                    .then(bump(&total));
                ctx.enqueue_builder_with_counter(builder, &outer);
            }),
            &done,
        );
    }

    manager.wait_for(&done, 0);
    assert_eq!(total.load(Ordering::SeqCst), 20 * 5);
    assert_eq!(manager.live_continuations(), 0);
}
