//! Concurrency Tests
//!
//! These tests hammer the lifecycle primitives from many threads:
//! 1. Reference counts fire their release action exactly once
//! 2. Concurrent closes run the close action once
//! 3. The two-word value cell never exposes a torn pair
//! 4. Concurrent maximum updates leave word 2 monotonic

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tether_core::config::TracingConfig;
use tether_core::{
    CloseCell, Closeable, LeakRegistry, LongValue, MappedRegion, QueryCloseable,
    ReferenceCounted, ReferenceCountedTracer, ReferenceOwner, ResourceError, TracerFactory,
    TwoLongValue,
};

const THREADS: usize = 8;

fn factories() -> Vec<TracerFactory> {
    let registry = Arc::new(LeakRegistry::new(TracingConfig {
        enabled: true,
        capture_operations: false,
        history_capacity: 8,
    }));
    vec![TracerFactory::vanilla(), TracerFactory::tracing(registry)]
}

fn counted(factory: &TracerFactory) -> (Arc<Box<dyn ReferenceCountedTracer>>, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&fired);
    let refs = factory.on_released(
        move || {
            hook.fetch_add(1, Ordering::SeqCst);
        },
        || "stress".to_owned(),
        "Stress",
    );
    (Arc::new(refs), fired)
}

// ============================================================================
// Reference Counting
// ============================================================================

#[test]
fn test_reserve_release_churn_never_fires_early() {
    for factory in factories() {
        let (refs, fired) = counted(&factory);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let refs = Arc::clone(&refs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let owner = ReferenceOwner::temporary("worker");
                    barrier.wait();
                    for _ in 0..1_000 {
                        refs.reserve(owner).unwrap();
                        refs.release(owner).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(refs.ref_count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        refs.release(ReferenceOwner::INIT).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_racing_final_releases_fire_once() {
    for factory in factories() {
        for _ in 0..20 {
            let (refs, fired) = counted(&factory);
            let owners: Vec<_> = (0..THREADS)
                .map(|_| {
                    let owner = ReferenceOwner::temporary("holder");
                    refs.reserve(owner).unwrap();
                    owner
                })
                .collect();
            refs.release(ReferenceOwner::INIT).unwrap();

            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = owners
                .into_iter()
                .map(|owner| {
                    let refs = Arc::clone(&refs);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        refs.release(owner).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(refs.ref_count(), 0);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }
}

#[test]
fn test_no_resurrection_under_contention() {
    for factory in factories() {
        let (refs, fired) = counted(&factory);
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let refs = Arc::clone(&refs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let owner = ReferenceOwner::temporary("late");
                    barrier.wait();
                    for _ in 0..2_000 {
                        match refs.reserve(owner) {
                            Ok(_) => {
                                refs.release(owner).unwrap();
                            }
                            Err(ResourceError::AlreadyReleased { .. }) => {}
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        refs.release(ReferenceOwner::INIT).unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(refs.ref_count(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(refs.reserve(ReferenceOwner::temporary("after")).is_err());
        assert!(!refs.try_reserve(ReferenceOwner::temporary("after")));
    }
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn test_concurrent_close_runs_action_once() {
    let cell = Arc::new(CloseCell::untracked("Socket"));
    let actions = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let actions = Arc::clone(&actions);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..125 {
                    cell.close_with(|| {
                        actions.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), ResourceError>(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(actions.load(Ordering::SeqCst), 1);
    assert!(cell.is_closed());
}

#[test]
fn test_concurrent_cell_close_releases_region_once() {
    let region = MappedRegion::anonymous(4096).unwrap();
    let cell = Arc::new(region.long_value(0).unwrap());
    assert_eq!(region.ref_count(), 2);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cell.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cell.is_closed());
    assert_eq!(region.ref_count(), 1);
    region.close().unwrap();
    assert!(region.is_closed());
}

// ============================================================================
// Two-Word Values
// ============================================================================

#[test]
fn test_two_long_pairs_are_never_torn() {
    const WRITES: i64 = 100_000;

    let region = MappedRegion::anonymous(4096).unwrap();
    let writer_cell = region.two_long_value(64).unwrap();
    let reader_cells: Vec<_> = (0..2).map(|_| region.two_long_value(64).unwrap()).collect();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = reader_cells
        .into_iter()
        .map(|cell| {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0u64;
                let mut last = 0;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let (value, value2) = cell.get_values().unwrap();
                    assert_eq!(value2, value * 2, "torn read: ({value}, {value2})");
                    assert!(value >= last, "pair went backwards: {value} < {last}");
                    last = value;
                    reads += 1;
                    if finished {
                        break;
                    }
                }
                cell.close().unwrap();
                (reads, last)
            })
        })
        .collect();

    for i in 1..=WRITES {
        writer_cell.set_values(i, i * 2).unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let (reads, last) = reader.join().unwrap();
        assert!(reads > 0);
        assert_eq!(last, WRITES);
    }
    assert_eq!(writer_cell.get_values().unwrap(), (WRITES, WRITES * 2));
}

fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn test_concurrent_set_max_value2_is_monotonic() {
    let region = MappedRegion::anonymous(4096).unwrap();
    let cell = Arc::new(region.two_long_value(0).unwrap());
    cell.set_values(0, -1).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let cell = Arc::clone(&cell);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = i64::MIN;
            while !done.load(Ordering::Acquire) {
                let seen = cell.get_volatile_value2().unwrap();
                assert!(seen >= last, "value2 decreased from {last} to {seen}");
                last = seen;
            }
        })
    };

    let writers: Vec<_> = (0..THREADS as u64)
        .map(|seed| {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                let mut highest = i64::MIN;
                for _ in 0..10_000 {
                    let target = (xorshift(&mut state) >> 1) as i64 % 1_000_000;
                    cell.set_max_value2(target).unwrap();
                    highest = highest.max(target);
                }
                highest
            })
        })
        .collect();

    let expected = writers
        .into_iter()
        .map(|writer| writer.join().unwrap())
        .max()
        .unwrap();
    done.store(true, Ordering::Release);
    observer.join().unwrap();

    assert_eq!(cell.get_volatile_value2().unwrap(), expected);
    assert_eq!(cell.get_volatile_value().unwrap(), 0);
}

#[test]
fn test_concurrent_set_min_value_on_long() {
    let region = MappedRegion::anonymous(4096).unwrap();
    let cell = Arc::new(region.long_value(8).unwrap());
    cell.set_volatile_value(i64::MAX).unwrap();

    let handles: Vec<_> = (0..THREADS as i64)
        .map(|t| {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for i in 0..1_000 {
                    cell.set_min_value(1_000_000 - i * THREADS as i64 - t).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let lowest = 1_000_000 - 999 * THREADS as i64 - (THREADS as i64 - 1);
    assert_eq!(cell.get_volatile_value().unwrap(), lowest);
}
